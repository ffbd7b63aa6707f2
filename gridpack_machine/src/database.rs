//! Typed CRUD over gridpack documents. The gateway is a trait so the
//! controller does not care whether documents live in MongoDB or in
//! memory; every write stamps `last_update`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::doc;
use mongodb::options::{AuthMechanism, ClientOptions, Credential, ServerAddress};
use mongodb::{Client, Collection};
use parking_lot::RwLock;
use tracing::debug;

use crate::gridpack::{GridpackData, Status};
use crate::{now_seconds, MachineConf};

const DATABASE_NAME: &str = "gridpacks";
const COLLECTION_NAME: &str = "gridpacks";

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert; idempotent w.r.t. a duplicate id (returns `false`).
    async fn create(&self, gridpack: &GridpackData) -> anyhow::Result<bool>;
    /// Whole-document replacement keyed by id.
    async fn update(&self, gridpack: &GridpackData) -> anyhow::Result<()>;
    async fn delete(&self, gridpack_id: &str) -> anyhow::Result<()>;
    async fn get(&self, gridpack_id: &str) -> anyhow::Result<Option<GridpackData>>;
    /// All documents, newest first.
    async fn get_all(&self) -> anyhow::Result<Vec<GridpackData>>;
    /// Union over the given statuses.
    async fn with_status(&self, statuses: &[Status]) -> anyhow::Result<Vec<GridpackData>>;
    /// Documents that produced the given artifact.
    async fn by_archive(
        &self,
        archive: &str,
        campaign: &str,
        generator: &str,
        process: &str,
    ) -> anyhow::Result<Vec<GridpackData>>;
    async fn count(&self) -> anyhow::Result<u64>;
}

fn stamped(gridpack: &GridpackData) -> GridpackData {
    let mut stamped = gridpack.clone();
    stamped.last_update = now_seconds();
    stamped
}

/// MongoDB-backed store.
pub struct MongoStore {
    gridpacks: Collection<GridpackData>,
}

impl MongoStore {
    pub fn new(conf: &MachineConf) -> anyhow::Result<Self> {
        let mut options = ClientOptions::default();
        options.hosts = vec![ServerAddress::Tcp {
            host: conf.mongo_host.clone(),
            port: Some(conf.mongo_port),
        }];
        if !conf.mongo_user.is_empty() {
            debug!("using the document store with username and password");
            options.credential = Some(
                Credential::builder()
                    .username(conf.mongo_user.clone())
                    .password(conf.mongo_password.clone())
                    .source("admin".to_string())
                    .mechanism(AuthMechanism::ScramSha256)
                    .build(),
            );
        } else {
            debug!("using the document store without username and password");
        }

        let client = Client::with_options(options)?;
        let gridpacks = client
            .database(DATABASE_NAME)
            .collection::<GridpackData>(COLLECTION_NAME);
        Ok(MongoStore { gridpacks })
    }
}

#[async_trait]
impl DocumentStore for MongoStore {
    async fn create(&self, gridpack: &GridpackData) -> anyhow::Result<bool> {
        match self.gridpacks.insert_one(stamped(gridpack)).await {
            Ok(_) => Ok(true),
            Err(error) if is_duplicate_key(&error) => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    async fn update(&self, gridpack: &GridpackData) -> anyhow::Result<()> {
        self.gridpacks
            .replace_one(doc! {"_id": &gridpack.id}, stamped(gridpack))
            .await?;
        Ok(())
    }

    async fn delete(&self, gridpack_id: &str) -> anyhow::Result<()> {
        self.gridpacks
            .delete_one(doc! {"_id": gridpack_id})
            .await?;
        Ok(())
    }

    async fn get(&self, gridpack_id: &str) -> anyhow::Result<Option<GridpackData>> {
        Ok(self.gridpacks.find_one(doc! {"_id": gridpack_id}).await?)
    }

    async fn get_all(&self) -> anyhow::Result<Vec<GridpackData>> {
        let cursor = self
            .gridpacks
            .find(doc! {})
            .sort(doc! {"_id": -1})
            .await?;
        Ok(cursor.try_collect().await?)
    }

    async fn with_status(&self, statuses: &[Status]) -> anyhow::Result<Vec<GridpackData>> {
        let alternatives: Vec<_> = statuses
            .iter()
            .map(|status| doc! {"status": status.to_string()})
            .collect();
        let cursor = self.gridpacks.find(doc! {"$or": alternatives}).await?;
        Ok(cursor.try_collect().await?)
    }

    async fn by_archive(
        &self,
        archive: &str,
        campaign: &str,
        generator: &str,
        process: &str,
    ) -> anyhow::Result<Vec<GridpackData>> {
        let filter = doc! {
            "archive": archive,
            "campaign": campaign,
            "generator": generator,
            "process": process,
        };
        let cursor = self.gridpacks.find(filter).sort(doc! {"_id": -1}).await?;
        Ok(cursor.try_collect().await?)
    }

    async fn count(&self) -> anyhow::Result<u64> {
        Ok(self.gridpacks.count_documents(doc! {}).await?)
    }
}

fn is_duplicate_key(error: &mongodb::error::Error) -> bool {
    use mongodb::error::{ErrorKind, WriteFailure};
    matches!(
        *error.kind,
        ErrorKind::Write(WriteFailure::WriteError(ref write_error)) if write_error.code == 11000
    )
}

/// In-memory store, for tests and scratch deployments.
#[derive(Default)]
pub struct MemStore {
    gridpacks: RwLock<BTreeMap<String, GridpackData>>,
}

impl MemStore {
    pub fn new() -> Self {
        MemStore::default()
    }
}

#[async_trait]
impl DocumentStore for MemStore {
    async fn create(&self, gridpack: &GridpackData) -> anyhow::Result<bool> {
        let mut gridpacks = self.gridpacks.write();
        if gridpacks.contains_key(&gridpack.id) {
            return Ok(false);
        }
        gridpacks.insert(gridpack.id.clone(), stamped(gridpack));
        Ok(true)
    }

    async fn update(&self, gridpack: &GridpackData) -> anyhow::Result<()> {
        self.gridpacks
            .write()
            .insert(gridpack.id.clone(), stamped(gridpack));
        Ok(())
    }

    async fn delete(&self, gridpack_id: &str) -> anyhow::Result<()> {
        self.gridpacks.write().remove(gridpack_id);
        Ok(())
    }

    async fn get(&self, gridpack_id: &str) -> anyhow::Result<Option<GridpackData>> {
        Ok(self.gridpacks.read().get(gridpack_id).cloned())
    }

    async fn get_all(&self) -> anyhow::Result<Vec<GridpackData>> {
        Ok(self.gridpacks.read().values().rev().cloned().collect())
    }

    async fn with_status(&self, statuses: &[Status]) -> anyhow::Result<Vec<GridpackData>> {
        Ok(self
            .gridpacks
            .read()
            .values()
            .filter(|gridpack| statuses.contains(&gridpack.status))
            .cloned()
            .collect())
    }

    async fn by_archive(
        &self,
        archive: &str,
        campaign: &str,
        generator: &str,
        process: &str,
    ) -> anyhow::Result<Vec<GridpackData>> {
        Ok(self
            .gridpacks
            .read()
            .values()
            .rev()
            .filter(|gridpack| {
                gridpack.archive == archive
                    && gridpack.campaign == campaign
                    && gridpack.generator == generator
                    && gridpack.process == process
            })
            .cloned()
            .collect())
    }

    async fn count(&self) -> anyhow::Result<u64> {
        Ok(self.gridpacks.read().len() as u64)
    }
}
