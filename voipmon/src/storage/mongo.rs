//! MongoDB-backed document store.

use mongodb::bson::{self, Document};
use mongodb::{Client, Database};
use serde_json::Value;
use tracing::{error, info};

use super::DocumentStore;
use crate::error::Result;

pub struct MongoStore {
    db: Database,
}

impl MongoStore {
    pub async fn connect(uri: &str, db: &str) -> Result<Self> {
        let client = Client::with_uri_str(uri).await?;
        info!(db, "connected to document store");
        Ok(Self {
            db: client.database(db),
        })
    }

    fn to_documents(documents: Vec<Value>) -> Vec<Document> {
        documents
            .into_iter()
            .filter_map(|value| match bson::to_document(&value) {
                Ok(document) => Some(document),
                Err(err) => {
                    error!(%err, "document is not BSON-serializable, skipping");
                    None
                }
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl DocumentStore for MongoStore {
    async fn insert_many(&self, collection: &str, documents: Vec<Value>) -> Result<()> {
        let documents = Self::to_documents(documents);
        if documents.is_empty() {
            return Ok(());
        }
        self.db
            .collection::<Document>(collection)
            .insert_many(documents)
            .await?;
        Ok(())
    }

    async fn upsert(&self, collection: &str, key_field: &str, document: Value) -> Result<()> {
        let document = bson::to_document(&document)
            .map_err(|err| mongodb::error::Error::custom(format!("not a document: {err}")))?;
        let key = document.get(key_field).cloned().ok_or_else(|| {
            mongodb::error::Error::custom(format!("upsert document lacks '{key_field}'"))
        })?;
        let mut filter = Document::new();
        filter.insert(key_field, key);
        self.db
            .collection::<Document>(collection)
            .replace_one(filter, document)
            .upsert(true)
            .await?;
        Ok(())
    }
}
