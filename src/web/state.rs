use crate::repository::{Store, VersionedRepository};
use crate::model::EntityFields;
use crate::web::auth::AuthSettings;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub auth: Arc<AuthSettings>,
}

impl AppState {
    pub fn new(store: Store, auth: AuthSettings) -> Self {
        Self {
            store,
            auth: Arc::new(auth),
        }
    }

    pub fn repository<T: EntityFields>(&self) -> VersionedRepository<T> {
        self.store.repository()
    }
}
