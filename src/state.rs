use crate::query::QueryEngine;

#[derive(Clone)]
pub struct AppState {
    pub(crate) query: QueryEngine,
}
