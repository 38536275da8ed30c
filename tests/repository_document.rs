use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use brokercrm::{
    ConflictReason, Document, DocumentBackend, MutationOutcome, RecordBackend, Store, StoreError,
    SystemClock, VersionedRepository, WriteContext,
    model::{Actor, Customer, Enquiry, Note, StageHistoryEntry, User},
    storage::{
        BackendKind, DocumentFilter, InsertOutcome, TimestampCheck, WriteGuard, WriteReceipt,
    },
};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::{Value, json};

fn doc(value: Value) -> Document {
    value.as_object().cloned().expect("object literal")
}

fn store() -> (Arc<DocumentBackend>, Store) {
    let backend = Arc::new(DocumentBackend::in_memory("crm_test"));
    let store = Store::new(backend.clone(), Arc::new(SystemClock::new()));
    (backend, store)
}

fn broker(name: &str) -> Actor {
    Actor {
        id: "USR002".to_string(),
        email: format!("{}@example.com", name.to_lowercase()),
        display_name: Some(name.to_string()),
        role: "broker".to_string(),
    }
}

async fn create_customer(repo: &VersionedRepository<Customer>, name: &str) -> String {
    repo.create(doc(json!({ "name": name })), None)
        .await
        .expect("backend ok")
        .applied()
        .expect("customer created")
        .id
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_updates_from_one_version_admit_exactly_one_writer() {
    let (_, store) = store();
    let customers = store.repository::<Customer>();
    let id = create_customer(&customers, "Ada").await;

    let writers = (0..16).map(|n| {
        let customers = customers.clone();
        let id = id.clone();
        tokio::spawn(async move {
            customers
                .update(
                    &id,
                    doc(json!({ "phone": format!("555-{n:04}") })),
                    &WriteContext::at_version(1),
                    Some(&broker("Writer")),
                )
                .await
        })
    });
    let outcomes: Vec<MutationOutcome<Customer>> = join_all(writers)
        .await
        .into_iter()
        .map(|joined| joined.expect("task ran").expect("backend ok"))
        .collect();

    let applied = outcomes.iter().filter(|o| o.is_applied()).count();
    let conflicts = outcomes.iter().filter(|o| o.is_conflict()).count();
    assert_eq!(applied, 1);
    assert_eq!(conflicts, 15);

    let stored = customers.get(&id).await.unwrap().unwrap();
    assert_eq!(stored.version(), 2);
}

#[tokio::test]
async fn create_then_read_has_mirrored_audit_fields() {
    let (_, store) = store();
    let customers = store.repository::<Customer>();
    let jane = broker("Jane");

    let created = customers
        .create(doc(json!({ "name": "Ada", "email": "ada@example.com" })), Some(&jane))
        .await
        .unwrap()
        .applied()
        .unwrap();
    let read = customers.get(&created.id).await.unwrap().unwrap();

    assert_eq!(read.version(), 1);
    assert_eq!(read.audit.created_by.as_deref(), Some("Jane"));
    assert_eq!(read.audit.created_by, read.audit.modified_by);
    assert_eq!(read.audit.created_at, read.audit.last_modified_at);
    assert_eq!(read, created);
}

#[tokio::test]
async fn update_increments_and_stale_update_returns_current_record() {
    let (_, store) = store();
    let customers = store.repository::<Customer>();
    let id = create_customer(&customers, "Ada").await;

    let updated = customers
        .update(&id, doc(json!({ "status": "Inactive" })), &WriteContext::at_version(1), Some(&broker("Bob")))
        .await
        .unwrap()
        .applied()
        .unwrap();
    assert_eq!(updated.version(), 2);
    assert!(updated.audit.last_modified_at >= updated.audit.created_at);
    assert_eq!(updated.audit.created_by.as_deref(), Some("System"));

    let conflict = customers
        .update(&id, doc(json!({ "name": "Ada Lovelace" })), &WriteContext::at_version(1), None)
        .await
        .unwrap()
        .conflict()
        .unwrap();
    assert_eq!(conflict.reason, ConflictReason::StaleVersion);
    assert_eq!(conflict.client_version, Some(1));
    assert_eq!(conflict.server_version, Some(2));
    assert_eq!(conflict.modified_by.as_deref(), Some("Bob"));
    assert_eq!(conflict.server_data.as_ref(), Some(&updated));
    assert_eq!(customers.get(&id).await.unwrap().unwrap(), updated);
}

#[tokio::test]
async fn stale_delete_leaves_record_in_place() {
    let (_, store) = store();
    let customers = store.repository::<Customer>();
    let id = create_customer(&customers, "Ada").await;
    customers
        .update(&id, doc(json!({ "phone": "1" })), &WriteContext::at_version(1), None)
        .await
        .unwrap();
    let before = customers.get(&id).await.unwrap().unwrap();

    let outcome = customers
        .delete(&id, &WriteContext::at_version(1), None)
        .await
        .unwrap();
    assert!(outcome.is_conflict());
    assert_eq!(customers.get(&id).await.unwrap(), Some(before));

    let removed = customers
        .delete(&id, &WriteContext::at_version(2), None)
        .await
        .unwrap()
        .applied()
        .unwrap();
    assert_eq!(removed.id, id);
    assert!(customers.get(&id).await.unwrap().is_none());
}

#[tokio::test]
async fn enquiry_ids_continue_after_highest_and_never_refill_gaps() {
    let (backend, store) = store();
    let enquiries = store.repository::<Enquiry>();

    let first = enquiries
        .create(doc(json!({ "customerName": "Ada" })), None)
        .await
        .unwrap()
        .applied()
        .unwrap();
    assert_eq!(first.id, "ENQ001");

    backend
        .insert_one("enquiries", doc(json!({ "id": "ENQ003", "customerName": "Legacy" })))
        .await
        .unwrap();

    let next = enquiries
        .create(doc(json!({ "customerName": "Grace" })), None)
        .await
        .unwrap()
        .applied()
        .unwrap();
    assert_eq!(next.id, "ENQ004");
}

#[tokio::test]
async fn legacy_record_is_versioned_by_first_update() {
    let (backend, store) = store();
    backend
        .insert_one("notes", doc(json!({ "id": "NOTE1", "referenceId": "GKF00001", "content": "old" })))
        .await
        .unwrap();
    let notes = store.repository::<Note>();

    let updated = notes
        .update("NOTE1", doc(json!({ "content": "new" })), &WriteContext::default(), Some(&broker("Jane")))
        .await
        .unwrap()
        .applied()
        .unwrap();

    assert_eq!(updated.version(), 1);
    assert!(updated.audit.created_at.is_none());
    assert_eq!(updated.audit.modified_by.as_deref(), Some("Jane"));
    assert_eq!(updated.fields.content, "new");
}

#[tokio::test]
async fn invalid_update_is_reported_and_changes_nothing() {
    let (_, store) = store();
    let customers = store.repository::<Customer>();
    let id = create_customer(&customers, "Ada").await;

    let outcome = customers
        .update(&id, doc(json!({ "email": "not-an-address" })), &WriteContext::at_version(1), None)
        .await
        .unwrap();
    assert!(matches!(outcome, MutationOutcome::Invalid(_)));
    assert_eq!(customers.get(&id).await.unwrap().unwrap().version(), 1);
}

#[tokio::test]
async fn edits_keep_the_original_author_and_stage_user() {
    let (_, store) = store();
    let notes = store.repository::<Note>();
    let note = notes
        .create(
            doc(json!({ "referenceId": "ENQ001", "content": "called", "author": "Mallory" })),
            Some(&broker("Jane")),
        )
        .await
        .unwrap()
        .applied()
        .unwrap();
    assert_eq!(note.fields.author, "Jane");

    let edited = notes
        .update(
            &note.id,
            doc(json!({ "content": "called back", "author": "Mallory" })),
            &WriteContext::at_version(1),
            Some(&broker("Bob")),
        )
        .await
        .unwrap()
        .applied()
        .unwrap();
    assert_eq!(edited.fields.author, "Jane");
    assert_eq!(edited.fields.content, "called back");
    assert_eq!(edited.audit.modified_by.as_deref(), Some("Bob"));

    let history = store.repository::<StageHistoryEntry>();
    let entry = history
        .create(doc(json!({ "customerId": "GKF00001", "stage": "Lead" })), Some(&broker("Jane")))
        .await
        .unwrap()
        .applied()
        .unwrap();
    let moved = history
        .update(
            &entry.id,
            doc(json!({ "comment": "fixed typo", "user": "Mallory" })),
            &WriteContext::at_version(1),
            Some(&broker("Bob")),
        )
        .await
        .unwrap()
        .applied()
        .unwrap();
    assert_eq!(moved.fields.user, "Jane");
}

#[tokio::test]
async fn user_email_cannot_be_taken_twice() {
    let (_, store) = store();
    let users = store.repository::<User>();
    let create = |email: &str| {
        doc(json!({ "email": email, "role": "admin", "password": "longenough" }))
    };

    let first = users.create(create("a@x.com"), None).await.unwrap();
    assert!(first.is_applied());
    let second = users.create(create("A@x.com"), None).await.unwrap();
    assert!(matches!(second, MutationOutcome::Invalid(ref reason) if reason.contains("email")));

    let other = users
        .create(create("b@x.com"), None)
        .await
        .unwrap()
        .applied()
        .unwrap();
    let renamed = users
        .update(&other.id, doc(json!({ "email": " A@X.COM" })), &WriteContext::at_version(1), None)
        .await
        .unwrap();
    assert!(matches!(renamed, MutationOutcome::Invalid(_)));
    assert_eq!(users.get(&other.id).await.unwrap().unwrap().version(), 1);

    let recased = users
        .update("USR001", doc(json!({ "email": "A@x.com" })), &WriteContext::at_version(1), None)
        .await
        .unwrap();
    assert!(recased.is_applied());
    assert_eq!(users.list(None).await.unwrap().records.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_signups_with_one_email_admit_one() {
    let (_, store) = store();
    let users = store.repository::<User>();

    let signups = ["jo@example.com", "JO@example.com", "Jo@Example.com"].map(|email| {
        let users = users.clone();
        tokio::spawn(async move {
            users
                .create(doc(json!({ "email": email, "password": "longenough" })), None)
                .await
        })
    });
    let outcomes: Vec<MutationOutcome<User>> = join_all(signups)
        .await
        .into_iter()
        .map(|joined| joined.expect("task ran").expect("backend ok"))
        .collect();

    assert_eq!(outcomes.iter().filter(|o| o.is_applied()).count(), 1);
    assert_eq!(users.list(None).await.unwrap().records.len(), 1);
}

/// Another writer commits right after the repository's pre-check read.
struct InterleavingWriter {
    inner: DocumentBackend,
    delete_instead: bool,
}

impl InterleavingWriter {
    async fn rival_commit(&self, collection: &str, id: &str, expected: u64) {
        let filter = DocumentFilter::by_id(id).at_version(expected);
        if self.delete_instead {
            self.inner.delete_one(collection, &filter).await.unwrap();
            return;
        }
        let mut rival = self.inner.find_one(collection, &filter).await.unwrap().unwrap();
        rival.insert("version".to_string(), json!(expected + 1));
        rival.insert("modifiedBy".to_string(), json!("Rival"));
        self.inner
            .find_one_and_update(collection, &filter, rival)
            .await
            .unwrap();
    }
}

#[async_trait]
impl RecordBackend for InterleavingWriter {
    fn kind(&self) -> BackendKind {
        self.inner.kind()
    }

    async fn serialize_writes(&self, collection: &str) -> Option<WriteGuard> {
        self.inner.serialize_writes(collection).await
    }

    async fn check_file_timestamp(
        &self,
        collection: &str,
        expected: Option<DateTime<Utc>>,
    ) -> brokercrm::Result<TimestampCheck> {
        self.inner.check_file_timestamp(collection, expected).await
    }

    async fn fetch_all(&self, collection: &str) -> brokercrm::Result<Vec<Document>> {
        self.inner.fetch_all(collection).await
    }

    async fn fetch(&self, collection: &str, id: &str) -> brokercrm::Result<Option<Document>> {
        self.inner.fetch(collection, id).await
    }

    async fn insert(&self, collection: &str, document: Document) -> brokercrm::Result<InsertOutcome> {
        self.inner.insert(collection, document).await
    }

    async fn replace_if_version(
        &self,
        collection: &str,
        id: &str,
        expected: u64,
        document: Document,
    ) -> brokercrm::Result<Option<WriteReceipt>> {
        self.rival_commit(collection, id, expected).await;
        self.inner.replace_if_version(collection, id, expected, document).await
    }

    async fn delete_if_version(
        &self,
        collection: &str,
        id: &str,
        expected: u64,
    ) -> brokercrm::Result<Option<WriteReceipt>> {
        self.rival_commit(collection, id, expected).await;
        self.inner.delete_if_version(collection, id, expected).await
    }
}

async fn interleaved_customers(delete_instead: bool) -> (VersionedRepository<Customer>, String) {
    let backend = Arc::new(InterleavingWriter {
        inner: DocumentBackend::in_memory("crm_test"),
        delete_instead,
    });
    let customers: VersionedRepository<Customer> =
        VersionedRepository::new(backend, Arc::new(SystemClock::new()));
    let id = create_customer(&customers, "Ada").await;
    (customers, id)
}

#[tokio::test]
async fn update_losing_the_race_after_its_check_is_a_conflict() {
    let (customers, id) = interleaved_customers(false).await;

    let conflict = customers
        .update(&id, doc(json!({ "phone": "555-0100" })), &WriteContext::at_version(1), Some(&broker("Bob")))
        .await
        .unwrap()
        .conflict()
        .unwrap();

    assert_eq!(conflict.reason, ConflictReason::ConcurrentWrite);
    assert_eq!(conflict.client_version, Some(1));
    assert_eq!(conflict.server_version, Some(2));
    assert_eq!(conflict.modified_by.as_deref(), Some("Rival"));
    let stored = customers.get(&id).await.unwrap().unwrap();
    assert_eq!(stored.version(), 2);
    assert!(stored.fields.phone.is_none());
}

#[tokio::test]
async fn delete_losing_the_race_after_its_check_is_a_conflict() {
    let (customers, id) = interleaved_customers(false).await;

    let conflict = customers
        .delete(&id, &WriteContext::at_version(1), None)
        .await
        .unwrap()
        .conflict()
        .unwrap();

    assert_eq!(conflict.reason, ConflictReason::ConcurrentWrite);
    assert_eq!(conflict.server_version, Some(2));
    assert_eq!(customers.get(&id).await.unwrap().unwrap().version(), 2);
}

#[tokio::test]
async fn record_deleted_underneath_a_writer_is_a_conflict_without_server_data() {
    let (customers, id) = interleaved_customers(true).await;

    let conflict = customers
        .update(&id, doc(json!({ "phone": "555-0100" })), &WriteContext::at_version(1), None)
        .await
        .unwrap()
        .conflict()
        .unwrap();

    assert_eq!(conflict.reason, ConflictReason::ConcurrentWrite);
    assert_eq!(conflict.server_version, None);
    assert!(conflict.server_data.is_none());
    assert!(customers.get(&id).await.unwrap().is_none());
}

/// Lets a competing creator claim the allocated id right before the insert.
struct CompetingCreator {
    inner: DocumentBackend,
    steals: AtomicUsize,
}

#[async_trait]
impl RecordBackend for CompetingCreator {
    fn kind(&self) -> BackendKind {
        self.inner.kind()
    }

    async fn serialize_writes(&self, collection: &str) -> Option<WriteGuard> {
        self.inner.serialize_writes(collection).await
    }

    async fn check_file_timestamp(
        &self,
        collection: &str,
        expected: Option<DateTime<Utc>>,
    ) -> brokercrm::Result<TimestampCheck> {
        self.inner.check_file_timestamp(collection, expected).await
    }

    async fn fetch_all(&self, collection: &str) -> brokercrm::Result<Vec<Document>> {
        self.inner.fetch_all(collection).await
    }

    async fn fetch(&self, collection: &str, id: &str) -> brokercrm::Result<Option<Document>> {
        self.inner.fetch(collection, id).await
    }

    async fn insert(&self, collection: &str, document: Document) -> brokercrm::Result<InsertOutcome> {
        let remaining = self.steals.load(Ordering::SeqCst);
        if remaining > 0 {
            self.steals.store(remaining - 1, Ordering::SeqCst);
            let mut rival = document.clone();
            rival.insert("name".to_string(), json!("Rival"));
            self.inner.insert(collection, rival).await?;
        }
        self.inner.insert(collection, document).await
    }

    async fn replace_if_version(
        &self,
        collection: &str,
        id: &str,
        expected: u64,
        document: Document,
    ) -> brokercrm::Result<Option<WriteReceipt>> {
        self.inner.replace_if_version(collection, id, expected, document).await
    }

    async fn delete_if_version(
        &self,
        collection: &str,
        id: &str,
        expected: u64,
    ) -> brokercrm::Result<Option<WriteReceipt>> {
        self.inner.delete_if_version(collection, id, expected).await
    }
}

#[tokio::test]
async fn id_collision_is_retried_with_a_fresh_id() {
    let backend = Arc::new(CompetingCreator {
        inner: DocumentBackend::in_memory("crm_test"),
        steals: AtomicUsize::new(2),
    });
    let customers: VersionedRepository<Customer> =
        VersionedRepository::new(backend, Arc::new(SystemClock::new())).with_id_retry_limit(5);

    let created = customers
        .create(doc(json!({ "name": "Ada" })), None)
        .await
        .unwrap()
        .applied()
        .unwrap();

    assert_eq!(created.id, "GKF00003");
    assert_eq!(created.fields.name, "Ada");
    assert_eq!(customers.list(None).await.unwrap().records.len(), 3);
}

#[tokio::test]
async fn id_collisions_past_the_limit_surface_as_backend_error() {
    let backend = Arc::new(CompetingCreator {
        inner: DocumentBackend::in_memory("crm_test"),
        steals: AtomicUsize::new(10),
    });
    let customers: VersionedRepository<Customer> =
        VersionedRepository::new(backend, Arc::new(SystemClock::new())).with_id_retry_limit(2);

    let err = customers
        .create(doc(json!({ "name": "Ada" })), None)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::IdExhausted(_, 2)));
}
