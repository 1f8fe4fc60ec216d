//! `Dragonfly` (Redis-compatible) hot entity store.
//!
//! `Dragonfly` holds the live participant and God Pack records. Each record
//! is a hash carrying a version counter next to the JSON body, and every
//! write goes through a Lua compare-and-set so two engine processes sharing
//! the same instance can never lose each other's updates.
//!
//! # Key Patterns
//!
//! | Pattern | Type | Description |
//! |---------|------|-------------|
//! | `participant:{id}` | Hash | `version` + `data` (JSON participant) |
//! | `gp:{id}` | Hash | `version` + `data` (JSON God Pack) |
//! | `participants:index` | Set | Every known participant id |
//! | `gps:index` | Set | Every known God Pack id |

use async_trait::async_trait;
use fred::prelude::*;
use reroll_core::store::{EntityKey, EntityStore, StoreError, Versioned};
use reroll_types::{GodPack, GodPackId, Participant, ParticipantId};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::DbError;

/// Set of all participant ids.
const PARTICIPANT_INDEX: &str = "participants:index";

/// Set of all God Pack ids.
const GOD_PACK_INDEX: &str = "gps:index";

/// Compare-and-set of a versioned hash.
///
/// `KEYS[1]` is the record, `KEYS[2]` the index set. `ARGV` is the expected
/// version (`0` for a create), the JSON body, and the index member. Returns
/// `{1, new_version}` on success and `{0, stored_version}` on mismatch,
/// where a stored version of `0` means the record does not exist.
const COMPARE_AND_SET: &str = r"
local current = tonumber(redis.call('HGET', KEYS[1], 'version') or '0')
local expected = tonumber(ARGV[1])
if current ~= expected then
  return {0, current}
end
local next_version = current + 1
redis.call('HSET', KEYS[1], 'version', next_version, 'data', ARGV[2])
redis.call('SADD', KEYS[2], ARGV[3])
return {1, next_version}
";

/// Connection handle to a `Dragonfly` (Redis-compatible) instance.
///
/// Wraps a [`fred::prelude::Client`] and implements [`EntityStore`] over
/// the key patterns listed in the module docs.
#[derive(Clone)]
pub struct DragonflyPool {
    client: Client,
}

impl std::fmt::Debug for DragonflyPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DragonflyPool").finish_non_exhaustive()
    }
}

impl DragonflyPool {
    /// Connect to `Dragonfly` at the given URL.
    ///
    /// The URL should follow the Redis URL scheme:
    /// `redis://host:port` or `redis://host:port/db`
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Config`] if the URL cannot be parsed.
    /// Returns [`DbError::Dragonfly`] if the connection fails.
    pub async fn connect(url: &str) -> Result<Self, DbError> {
        let config = Config::from_url(url)
            .map_err(|e| DbError::Config(format!("Invalid Dragonfly URL: {e}")))?;

        let client = Builder::from_config(config).build()?;
        client.init().await?;

        tracing::info!("Connected to Dragonfly");
        Ok(Self { client })
    }

    /// Read a versioned record stored at `key`.
    async fn read_versioned<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<Versioned<T>>, DbError> {
        let fields: Vec<Option<String>> = self.client.hmget(key, vec!["version", "data"]).await?;
        let mut fields = fields.into_iter();
        let (version, data) = (fields.next().flatten(), fields.next().flatten());

        match (version, data) {
            (None, None) => Ok(None),
            (Some(version), Some(data)) => {
                let version = version.parse::<u64>().map_err(|e| DbError::Corrupt {
                    key: key.to_owned(),
                    reason: format!("version is not a valid u64: {e}"),
                })?;
                let value = serde_json::from_str(&data)?;
                Ok(Some(Versioned { version, value }))
            }
            _ => Err(DbError::Corrupt {
                key: key.to_owned(),
                reason: "record is missing its version or data field".to_owned(),
            }),
        }
    }

    /// Write `value` at `entity` if its stored version still matches.
    async fn write_versioned<T: Serialize + Sync>(
        &self,
        entity: EntityKey,
        index: &str,
        member: u64,
        value: &T,
        expected: Option<u64>,
    ) -> Result<u64, StoreError> {
        let key = entity.to_string();
        let json = serde_json::to_string(value).map_err(DbError::from)?;
        let expected_arg = expected.unwrap_or(0);

        let reply: Vec<i64> = self
            .client
            .eval(
                COMPARE_AND_SET,
                vec![key.as_str(), index],
                vec![expected_arg.to_string(), json, member.to_string()],
            )
            .await
            .map_err(DbError::from)?;

        let mut reply = reply.into_iter();
        let (applied, version) = match (reply.next(), reply.next()) {
            (Some(applied), Some(version)) => (applied, version),
            _ => {
                return Err(DbError::Corrupt {
                    key,
                    reason: "compare-and-set returned a malformed reply".to_owned(),
                }
                .into());
            }
        };
        let version = u64::try_from(version).map_err(|e| DbError::Corrupt {
            key: entity.to_string(),
            reason: format!("negative version: {e}"),
        })?;

        if applied == 1 {
            tracing::trace!(%entity, version, "Record written");
            return Ok(version);
        }

        let actual = (version != 0).then_some(version);
        Err(match expected {
            None => StoreError::AlreadyExists { key: entity },
            Some(expected) => StoreError::VersionConflict {
                key: entity,
                expected,
                actual,
            },
        })
    }

    /// Ids in an index set, ascending.
    async fn index_members(&self, index: &str) -> Result<Vec<u64>, DbError> {
        let members: Vec<String> = self.client.smembers(index).await?;
        let mut ids = members
            .iter()
            .map(|m| {
                m.parse::<u64>().map_err(|e| DbError::Corrupt {
                    key: index.to_owned(),
                    reason: format!("member {m:?} is not a valid id: {e}"),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        ids.sort_unstable();
        Ok(ids)
    }

    /// Flush all keys from the `Dragonfly` instance.
    ///
    /// **Warning:** This deletes all data. Only use in tests.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Dragonfly`] if the flush fails.
    pub async fn flush_all(&self) -> Result<(), DbError> {
        let _: () = self.client.flushall(false).await?;
        Ok(())
    }

    /// Close the connection.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Dragonfly`] if the client fails to shut down cleanly.
    pub async fn quit(&self) -> Result<(), DbError> {
        self.client.quit().await?;
        tracing::info!("Dragonfly connection closed");
        Ok(())
    }
}

#[async_trait]
impl EntityStore for DragonflyPool {
    async fn get_participant(
        &self,
        id: ParticipantId,
    ) -> Result<Option<Versioned<Participant>>, StoreError> {
        let key = EntityKey::Participant(id).to_string();
        Ok(self.read_versioned(&key).await?)
    }

    async fn put_participant(
        &self,
        participant: &Participant,
        expected: Option<u64>,
    ) -> Result<u64, StoreError> {
        self.write_versioned(
            EntityKey::Participant(participant.id),
            PARTICIPANT_INDEX,
            participant.id.get(),
            participant,
            expected,
        )
        .await
    }

    async fn list_participants(&self) -> Result<Vec<Participant>, StoreError> {
        let ids = self.index_members(PARTICIPANT_INDEX).await?;
        let mut participants = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.get_participant(ParticipantId::new(id)).await? {
                participants.push(record.value);
            }
        }
        Ok(participants)
    }

    async fn get_god_pack(&self, id: GodPackId) -> Result<Option<Versioned<GodPack>>, StoreError> {
        let key = EntityKey::GodPack(id).to_string();
        Ok(self.read_versioned(&key).await?)
    }

    async fn put_god_pack(&self, gp: &GodPack, expected: Option<u64>) -> Result<u64, StoreError> {
        self.write_versioned(
            EntityKey::GodPack(gp.id),
            GOD_PACK_INDEX,
            gp.id.get(),
            gp,
            expected,
        )
        .await
    }

    async fn list_god_packs(&self) -> Result<Vec<GodPack>, StoreError> {
        let ids = self.index_members(GOD_PACK_INDEX).await?;
        let mut god_packs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.get_god_pack(GodPackId::new(id)).await? {
                god_packs.push(record.value);
            }
        }
        Ok(god_packs)
    }
}
