//! Redis-backed index: sorted sets for ordering, JSON strings for entry
//! hydration, MULTI/EXEC pipelines for per-entry atomicity.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError};
use tracing::info;
use uuid::Uuid;
use vitrine_model::ids::CollectionId;
use vitrine_model::index::{
    CollectionFilter, IndexEntry, SortDirection, SortKey,
};

use super::CollectionIndex;
use super::keys;
use crate::error::{CatalogError, Result};

fn index_err(err: RedisError) -> CatalogError {
    CatalogError::Index(err.to_string())
}

fn decode_entry(json: &str) -> Result<IndexEntry> {
    serde_json::from_str(json)
        .map_err(|err| CatalogError::Index(format!("entry decode: {err}")))
}

#[derive(Clone)]
pub struct RedisIndex {
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisIndex")
            .field("connection", &"ConnectionManager")
            .finish()
    }
}

impl RedisIndex {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        info!(target: "index::redis", url = %redis_url, "connecting index backend");
        let client = redis::Client::open(redis_url).map_err(index_err)?;
        let conn = ConnectionManager::new(client).await.map_err(index_err)?;
        Ok(Self { conn })
    }

    async fn stored_entry(&self, id: CollectionId) -> Result<Option<IndexEntry>> {
        let mut conn = self.conn.clone();
        let json: Option<String> =
            conn.get(keys::entry_key(id)).await.map_err(index_err)?;
        json.as_deref().map(decode_entry).transpose()
    }

    fn push_member_removals(
        pipe: &mut redis::Pipeline,
        entry: &IndexEntry,
    ) {
        for sort in SortKey::ALL {
            let member = keys::member_for(entry, sort);
            for dir in SortDirection::ALL {
                for key in keys::set_keys_for_entry(entry, sort, dir) {
                    pipe.zrem(key, member.clone()).ignore();
                }
            }
        }
    }

    fn push_member_inserts(pipe: &mut redis::Pipeline, entry: &IndexEntry) {
        for sort in SortKey::ALL {
            let member = keys::member_for(entry, sort);
            for dir in SortDirection::ALL {
                let score = keys::score_for(entry, sort, dir);
                for key in keys::set_keys_for_entry(entry, sort, dir) {
                    pipe.zadd(key, member.clone(), score).ignore();
                }
            }
        }
    }

    /// Materialize the (library ∩ kind) set into a scratch key inside the
    /// same transaction as the read against it.
    fn with_intersection(
        pipe: &mut redis::Pipeline,
        base: &str,
        other: &str,
    ) -> String {
        let scratch = format!("idx:tmp:{}", Uuid::now_v7().simple());
        pipe.cmd("ZINTERSTORE")
            .arg(&scratch)
            .arg(2)
            .arg(base)
            .arg(other)
            .arg("WEIGHTS")
            .arg(1)
            .arg(0)
            .ignore();
        scratch
    }

    fn read_set(
        filter: &CollectionFilter,
        sort: SortKey,
        dir: SortDirection,
        pipe: &mut redis::Pipeline,
    ) -> (String, bool) {
        let base = keys::base_set_key(filter, sort, dir);
        match keys::intersect_set_key(filter, sort, dir) {
            Some(other) => (Self::with_intersection(pipe, &base, &other), true),
            None => (base, false),
        }
    }

    async fn hydrate(&self, ids: Vec<CollectionId>) -> Result<Vec<IndexEntry>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let entry_keys: Vec<String> =
            ids.iter().map(|id| keys::entry_key(*id)).collect();
        let payloads: Vec<Option<String>> =
            conn.mget(entry_keys).await.map_err(index_err)?;
        payloads
            .into_iter()
            .flatten()
            .map(|json| decode_entry(&json))
            .collect()
    }
}

#[async_trait]
impl CollectionIndex for RedisIndex {
    async fn upsert_entry(&self, entry: &IndexEntry) -> Result<()> {
        let old = self.stored_entry(entry.id).await?;
        let json = serde_json::to_string(entry)?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.set(keys::entry_key(entry.id), json).ignore();
        if let Some(old) = &old {
            Self::push_member_removals(&mut pipe, old);
        }
        Self::push_member_inserts(&mut pipe, entry);

        let mut conn = self.conn.clone();
        pipe.query_async::<()>(&mut conn).await.map_err(index_err)
    }

    async fn remove_entry(&self, id: CollectionId) -> Result<()> {
        let Some(old) = self.stored_entry(id).await? else {
            return Ok(());
        };

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.del(keys::entry_key(id)).ignore();
        Self::push_member_removals(&mut pipe, &old);

        let mut conn = self.conn.clone();
        pipe.query_async::<()>(&mut conn).await.map_err(index_err)
    }

    async fn entry(&self, id: CollectionId) -> Result<Option<IndexEntry>> {
        self.stored_entry(id).await
    }

    async fn rank(
        &self,
        id: CollectionId,
        sort: SortKey,
        dir: SortDirection,
        filter: &CollectionFilter,
    ) -> Result<Option<u64>> {
        let Some(entry) = self.stored_entry(id).await? else {
            return Ok(None);
        };
        let member = keys::member_for(&entry, sort);

        let mut pipe = redis::pipe();
        pipe.atomic();
        let (set, scratch) = Self::read_set(filter, sort, dir, &mut pipe);
        if keys::reads_in_reverse(sort, dir) {
            pipe.zrevrank(&set, member);
        } else {
            pipe.zrank(&set, member);
        }
        if scratch {
            pipe.del(&set).ignore();
        }

        let mut conn = self.conn.clone();
        let (rank,): (Option<i64>,) =
            pipe.query_async(&mut conn).await.map_err(index_err)?;
        Ok(rank.map(|r| r as u64))
    }

    async fn range(
        &self,
        sort: SortKey,
        dir: SortDirection,
        filter: &CollectionFilter,
        start: u64,
        stop: u64,
    ) -> Result<Vec<IndexEntry>> {
        if stop < start {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        let (set, scratch) = Self::read_set(filter, sort, dir, &mut pipe);
        if keys::reads_in_reverse(sort, dir) {
            pipe.zrevrange(&set, start as isize, stop as isize);
        } else {
            pipe.zrange(&set, start as isize, stop as isize);
        }
        if scratch {
            pipe.del(&set).ignore();
        }

        let mut conn = self.conn.clone();
        let (members,): (Vec<String>,) =
            pipe.query_async(&mut conn).await.map_err(index_err)?;
        let ids: Vec<CollectionId> = members
            .iter()
            .filter_map(|member| keys::id_from_member(member, sort))
            .collect();
        self.hydrate(ids).await
    }

    async fn count(&self, filter: &CollectionFilter) -> Result<u64> {
        let sort = SortKey::UpdatedAt;
        let dir = SortDirection::Ascending;

        let mut pipe = redis::pipe();
        pipe.atomic();
        let (set, scratch) = Self::read_set(filter, sort, dir, &mut pipe);
        pipe.zcard(&set);
        if scratch {
            pipe.del(&set).ignore();
        }

        let mut conn = self.conn.clone();
        let (count,): (u64,) =
            pipe.query_async(&mut conn).await.map_err(index_err)?;
        Ok(count)
    }

    async fn clear(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let index_keys: Vec<String> =
            conn.keys("idx:*").await.map_err(index_err)?;
        if !index_keys.is_empty() {
            let _: () = conn.del(index_keys).await.map_err(index_err)?;
        }
        Ok(())
    }

    async fn is_valid(&self) -> Result<bool> {
        let mut conn = self.conn.clone();
        let flag: Option<String> = conn
            .hget(keys::META_KEY, keys::VALID_FIELD)
            .await
            .map_err(index_err)?;
        Ok(flag.as_deref() == Some("1"))
    }

    async fn set_valid(&self, valid: bool) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(keys::META_KEY, keys::VALID_FIELD, if valid { "1" } else { "0" })
            .await
            .map_err(index_err)?;
        Ok(())
    }
}
