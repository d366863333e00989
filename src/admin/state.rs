use std::sync::Arc;

use crate::ledger::{BookieStorage, DeletedLedgers};

#[derive(Clone)]
pub struct AdminState {
    pub storage: Arc<BookieStorage>,
    pub deleted: Arc<DeletedLedgers>,
}

impl AdminState {
    pub fn new(storage: Arc<BookieStorage>, deleted: Arc<DeletedLedgers>) -> Self {
        Self { storage, deleted }
    }
}
