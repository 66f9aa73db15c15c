//! RocksDB-backed persistent reward state.
//!
//! Implements [`RewardStore`] using one column family per record kind.
//! Values are bincode; keys are raw ids or length-prefixed owner ids.
//! Every multi-record mutation is a single atomic [`WriteBatch`].
//!
//! Compare-and-swap writes hold `write_lock` across their read and write so
//! two writers in this process cannot both pass the version check. Plain
//! reads never take it.

use std::collections::BTreeSet;
use std::path::Path;

use async_trait::async_trait;
use parking_lot::Mutex;
use rocksdb::{ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, DB};
use tracing::info;

use accrue_core::error::StoreError;
use accrue_core::traits::RewardStore;
use accrue_core::types::{
    Balance, Discrepancy, EarningEvent, Entitlements, Hash256, OwnerId, ReferralEdge, ReferralStatus,
    Session, Stake,
};

// --- Column family names ---

const CF_SESSIONS: &str = "sessions";
const CF_ACTIVE_SESSIONS: &str = "active_sessions";
const CF_LATEST_SESSIONS: &str = "latest_sessions";
const CF_EVENTS: &str = "events";
const CF_OWNER_EVENTS: &str = "owner_events";
const CF_BALANCES: &str = "balances";
const CF_STAKES: &str = "stakes";
const CF_OWNER_STAKE: &str = "owner_stake";
const CF_REFERRALS: &str = "referrals";
const CF_SPONSOR_INDEX: &str = "sponsor_index";
const CF_ENTITLEMENTS: &str = "entitlements";
const CF_DISCREPANCIES: &str = "discrepancies";
const CF_METADATA: &str = "metadata";

/// All column family names.
const ALL_CFS: &[&str] = &[
    CF_SESSIONS,
    CF_ACTIVE_SESSIONS,
    CF_LATEST_SESSIONS,
    CF_EVENTS,
    CF_OWNER_EVENTS,
    CF_BALANCES,
    CF_STAKES,
    CF_OWNER_STAKE,
    CF_REFERRALS,
    CF_SPONSOR_INDEX,
    CF_ENTITLEMENTS,
    CF_DISCREPANCIES,
    CF_METADATA,
];

// --- Metadata key prefixes (followed by the raw owner id) ---

const META_EVENT_SEQ: &[u8] = b"event_seq/";
const META_DISCREPANCY_SEQ: &[u8] = b"discrepancy_seq/";

/// RocksDB-backed reward store.
pub struct RocksStore {
    db: DB,
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open or create a database at the given path, creating any missing
    /// column families.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cf_descriptors).map_err(db_err)?;
        info!(path = %path.as_ref().display(), "reward store opened");
        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    /// Total number of stored events.
    pub fn event_count(&self) -> Result<usize, StoreError> {
        let cf = self.cf_handle(CF_EVENTS)?;
        let mut count = 0;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            item.map_err(db_err)?;
            count += 1;
        }
        Ok(count)
    }

    // --- Internal helpers ---

    /// Get a column family handle.
    fn cf_handle(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Backend(format!("missing column family: {name}")))
    }

    /// Read and decode one record.
    fn get<T: bincode::Decode<()>>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>, StoreError> {
        let cf = self.cf_handle(cf_name)?;
        match self.db.get_cf(cf, key).map_err(db_err)? {
            Some(bytes) => decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn get_hash(&self, cf_name: &str, key: &[u8]) -> Result<Option<Hash256>, StoreError> {
        let cf = self.cf_handle(cf_name)?;
        match self.db.get_cf(cf, key).map_err(db_err)? {
            Some(bytes) => hash_from_slice(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Get a u64 counter from the metadata column family.
    fn get_meta_u64(&self, key: &[u8]) -> Result<u64, StoreError> {
        let cf = self.cf_handle(CF_METADATA)?;
        match self.db.get_cf(cf, key).map_err(db_err)? {
            Some(bytes) => {
                let arr: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StoreError::Corrupt("invalid metadata value length".into()))?;
                Ok(u64::from_le_bytes(arr))
            }
            None => Ok(0),
        }
    }

    /// Values of every key in `cf_name` that starts with `prefix`, in key order.
    fn scan_prefix(&self, cf_name: &str, prefix: &[u8]) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>, StoreError> {
        let cf = self.cf_handle(cf_name)?;
        let mut out = Vec::new();
        for item in self.db.prefix_iterator_cf(cf, prefix) {
            let (key, value) = item.map_err(db_err)?;
            // Without a prefix extractor the iterator runs past the prefix.
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key, value));
        }
        Ok(out)
    }

    /// Owner ids stored as raw keys in `cf_name`.
    fn owner_keys(&self, cf_name: &str, out: &mut BTreeSet<OwnerId>) -> Result<(), StoreError> {
        let cf = self.cf_handle(cf_name)?;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item.map_err(db_err)?;
            out.insert(owner_from_bytes(&key)?);
        }
        Ok(())
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        self.db.write(batch).map_err(db_err)
    }
}

/// Map a RocksDB error onto the store taxonomy. Lock contention and
/// timeouts are worth retrying; everything else is not.
fn db_err(e: rocksdb::Error) -> StoreError {
    use rocksdb::ErrorKind;
    match e.kind() {
        ErrorKind::Busy | ErrorKind::TimedOut | ErrorKind::TryAgain | ErrorKind::Incomplete => {
            StoreError::Transient(e.to_string())
        }
        ErrorKind::Corruption => StoreError::Corrupt(e.to_string()),
        _ => StoreError::Backend(e.to_string()),
    }
}

fn encode<T: bincode::Encode>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::encode_to_vec(value, bincode::config::standard()).map_err(|e| StoreError::Backend(e.to_string()))
}

fn decode<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
    Ok(value)
}

fn hash_from_slice(bytes: &[u8]) -> Result<Hash256, StoreError> {
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| StoreError::Corrupt(format!("id must be 32 bytes, got {}", bytes.len())))?;
    Ok(Hash256(arr))
}

fn owner_from_bytes(bytes: &[u8]) -> Result<OwnerId, StoreError> {
    std::str::from_utf8(bytes)
        .map(OwnerId::new)
        .map_err(|e| StoreError::Corrupt(format!("owner key: {e}")))
}

/// Encode a composite-key prefix: owner_len(BE u32) || owner.
///
/// The length keeps `"al"` from being a prefix of `"alice"`.
fn owner_prefix(owner: &OwnerId) -> Vec<u8> {
    let raw = owner.as_str().as_bytes();
    let mut key = Vec::with_capacity(4 + raw.len() + 32);
    key.extend_from_slice(&(raw.len() as u32).to_be_bytes());
    key.extend_from_slice(raw);
    key
}

/// Encode an ordered per-owner key: owner_prefix || seq(BE).
fn owner_seq_key(owner: &OwnerId, seq: u64) -> Vec<u8> {
    let mut key = owner_prefix(owner);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

/// Encode a sponsor index key: owner_prefix(sponsor) || referred.
fn sponsor_index_key(sponsor: &OwnerId, referred: &OwnerId) -> Vec<u8> {
    let mut key = owner_prefix(sponsor);
    key.extend_from_slice(referred.as_str().as_bytes());
    key
}

fn meta_key(prefix: &[u8], owner: &OwnerId) -> Vec<u8> {
    [prefix, owner.as_str().as_bytes()].concat()
}

fn check_version(entity: &'static str, expected: u64, found: u64) -> Result<(), StoreError> {
    if expected != found {
        return Err(StoreError::VersionConflict { entity, expected, found });
    }
    Ok(())
}

#[async_trait]
impl RewardStore for RocksStore {
    async fn fetch_active_session(&self, owner: &OwnerId) -> Result<Option<Session>, StoreError> {
        match self.get_hash(CF_ACTIVE_SESSIONS, owner.as_str().as_bytes())? {
            Some(id) => self.get(CF_SESSIONS, id.as_bytes()),
            None => Ok(None),
        }
    }

    async fn fetch_session(&self, id: &Hash256) -> Result<Option<Session>, StoreError> {
        self.get(CF_SESSIONS, id.as_bytes())
    }

    async fn fetch_latest_session(&self, owner: &OwnerId) -> Result<Option<Session>, StoreError> {
        match self.get_hash(CF_LATEST_SESSIONS, owner.as_str().as_bytes())? {
            Some(id) => self.get(CF_SESSIONS, id.as_bytes()),
            None => Ok(None),
        }
    }

    async fn create_session(&self, session: &Session) -> Result<Session, StoreError> {
        let _w = self.write_lock.lock();
        let owner_key = session.owner.as_str().as_bytes();
        if let Some(existing) = self.get_hash(CF_ACTIVE_SESSIONS, owner_key)? {
            return Err(StoreError::SessionExists {
                owner: session.owner.clone(),
                existing,
            });
        }
        if self.get::<Session>(CF_SESSIONS, session.id.as_bytes())?.is_some() {
            return Err(StoreError::SessionExists {
                owner: session.owner.clone(),
                existing: session.id,
            });
        }

        let mut committed = session.clone();
        committed.version = 1;
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf_handle(CF_SESSIONS)?, committed.id.as_bytes(), encode(&committed)?);
        if committed.is_active() {
            batch.put_cf(self.cf_handle(CF_ACTIVE_SESSIONS)?, owner_key, committed.id.as_bytes());
        }
        batch.put_cf(self.cf_handle(CF_LATEST_SESSIONS)?, owner_key, committed.id.as_bytes());
        self.write(batch)?;
        Ok(committed)
    }

    async fn update_session(&self, session: &Session) -> Result<Session, StoreError> {
        let _w = self.write_lock.lock();
        let stored: Session = self
            .get(CF_SESSIONS, session.id.as_bytes())?
            .ok_or_else(|| StoreError::Corrupt(format!("unknown session {}", session.id)))?;
        check_version("session", session.version, stored.version)?;

        let mut committed = session.clone();
        committed.version += 1;
        let owner_key = committed.owner.as_str().as_bytes();
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf_handle(CF_SESSIONS)?, committed.id.as_bytes(), encode(&committed)?);
        if !committed.is_active() && self.get_hash(CF_ACTIVE_SESSIONS, owner_key)? == Some(committed.id) {
            batch.delete_cf(self.cf_handle(CF_ACTIVE_SESSIONS)?, owner_key);
        }
        self.write(batch)?;
        Ok(committed)
    }

    async fn append_earning_event(&self, event: &EarningEvent) -> Result<bool, StoreError> {
        let _w = self.write_lock.lock();
        let cf_events = self.cf_handle(CF_EVENTS)?;
        if self.db.get_cf(cf_events, event.id.as_bytes()).map_err(db_err)?.is_some() {
            return Ok(false);
        }

        let seq_key = meta_key(META_EVENT_SEQ, &event.owner);
        let seq = self.get_meta_u64(&seq_key)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_events, event.id.as_bytes(), encode(event)?);
        batch.put_cf(
            self.cf_handle(CF_OWNER_EVENTS)?,
            owner_seq_key(&event.owner, seq),
            event.id.as_bytes(),
        );
        batch.put_cf(self.cf_handle(CF_METADATA)?, &seq_key, (seq + 1).to_le_bytes());
        self.write(batch)?;
        Ok(true)
    }

    async fn fetch_earning_event(&self, id: &Hash256) -> Result<Option<EarningEvent>, StoreError> {
        self.get(CF_EVENTS, id.as_bytes())
    }

    async fn events_for_owner(&self, owner: &OwnerId) -> Result<Vec<EarningEvent>, StoreError> {
        let mut events = Vec::new();
        for (_, id_bytes) in self.scan_prefix(CF_OWNER_EVENTS, &owner_prefix(owner))? {
            let id = hash_from_slice(&id_bytes)?;
            let event = self
                .get(CF_EVENTS, id.as_bytes())?
                .ok_or_else(|| StoreError::Corrupt(format!("dangling event index {id}")))?;
            events.push(event);
        }
        Ok(events)
    }

    async fn fetch_balance(&self, owner: &OwnerId) -> Result<Balance, StoreError> {
        Ok(self
            .get(CF_BALANCES, owner.as_str().as_bytes())?
            .unwrap_or_else(|| Balance::new(owner.clone())))
    }

    async fn store_balance(&self, balance: &Balance) -> Result<Balance, StoreError> {
        let _w = self.write_lock.lock();
        let key = balance.owner.as_str().as_bytes();
        let found = self.get::<Balance>(CF_BALANCES, key)?.map_or(0, |b| b.version);
        check_version("balance", balance.version, found)?;

        let mut committed = balance.clone();
        committed.version += 1;
        self.db
            .put_cf(self.cf_handle(CF_BALANCES)?, key, encode(&committed)?)
            .map_err(db_err)?;
        Ok(committed)
    }

    async fn fetch_stake(&self, owner: &OwnerId) -> Result<Option<Stake>, StoreError> {
        match self.get_hash(CF_OWNER_STAKE, owner.as_str().as_bytes())? {
            Some(id) => self.get(CF_STAKES, id.as_bytes()),
            None => Ok(None),
        }
    }

    async fn fetch_stake_by_id(&self, id: &Hash256) -> Result<Option<Stake>, StoreError> {
        self.get(CF_STAKES, id.as_bytes())
    }

    async fn update_stake(&self, stake: &Stake) -> Result<Stake, StoreError> {
        let _w = self.write_lock.lock();
        let found = self.get::<Stake>(CF_STAKES, stake.id.as_bytes())?.map_or(0, |s| s.version);
        check_version("stake", stake.version, found)?;

        let mut committed = stake.clone();
        committed.version += 1;
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf_handle(CF_STAKES)?, committed.id.as_bytes(), encode(&committed)?);
        if stake.version == 0 {
            batch.put_cf(
                self.cf_handle(CF_OWNER_STAKE)?,
                committed.owner.as_str().as_bytes(),
                committed.id.as_bytes(),
            );
        }
        self.write(batch)?;
        Ok(committed)
    }

    async fn fetch_referral_edge(&self, referred: &OwnerId) -> Result<Option<ReferralEdge>, StoreError> {
        self.get(CF_REFERRALS, referred.as_str().as_bytes())
    }

    async fn put_referral_edge(&self, edge: &ReferralEdge) -> Result<(), StoreError> {
        let _w = self.write_lock.lock();
        let referred_key = edge.referred.as_str().as_bytes();
        let mut batch = WriteBatch::default();
        if let Some(previous) = self.get::<ReferralEdge>(CF_REFERRALS, referred_key)? {
            if previous.sponsor != edge.sponsor {
                batch.delete_cf(
                    self.cf_handle(CF_SPONSOR_INDEX)?,
                    sponsor_index_key(&previous.sponsor, &edge.referred),
                );
            }
        }
        batch.put_cf(self.cf_handle(CF_REFERRALS)?, referred_key, encode(edge)?);
        batch.put_cf(
            self.cf_handle(CF_SPONSOR_INDEX)?,
            sponsor_index_key(&edge.sponsor, &edge.referred),
            b"",
        );
        self.write(batch)
    }

    async fn fetch_referral_count(&self, sponsor: &OwnerId) -> Result<u32, StoreError> {
        let edges = self.referrals_of(sponsor).await?;
        Ok(edges.iter().filter(|e| e.status == ReferralStatus::Active).count() as u32)
    }

    async fn referrals_of(&self, sponsor: &OwnerId) -> Result<Vec<ReferralEdge>, StoreError> {
        let prefix = owner_prefix(sponsor);
        let mut edges = Vec::new();
        for (key, _) in self.scan_prefix(CF_SPONSOR_INDEX, &prefix)? {
            let referred = owner_from_bytes(&key[prefix.len()..])?;
            let edge = self
                .fetch_referral_edge(&referred)
                .await?
                .ok_or_else(|| StoreError::Corrupt(format!("dangling sponsor index for {referred}")))?;
            edges.push(edge);
        }
        Ok(edges)
    }

    async fn fetch_entitlements(&self, owner: &OwnerId) -> Result<Entitlements, StoreError> {
        Ok(self
            .get(CF_ENTITLEMENTS, owner.as_str().as_bytes())?
            .unwrap_or_else(|| Entitlements::new(owner.clone())))
    }

    async fn put_entitlements(&self, entitlements: &Entitlements) -> Result<(), StoreError> {
        self.db
            .put_cf(
                self.cf_handle(CF_ENTITLEMENTS)?,
                entitlements.owner.as_str().as_bytes(),
                encode(entitlements)?,
            )
            .map_err(db_err)
    }

    async fn record_discrepancy(&self, discrepancy: &Discrepancy) -> Result<(), StoreError> {
        let _w = self.write_lock.lock();
        let seq_key = meta_key(META_DISCREPANCY_SEQ, &discrepancy.owner);
        let seq = self.get_meta_u64(&seq_key)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf_handle(CF_DISCREPANCIES)?,
            owner_seq_key(&discrepancy.owner, seq),
            encode(discrepancy)?,
        );
        batch.put_cf(self.cf_handle(CF_METADATA)?, &seq_key, (seq + 1).to_le_bytes());
        self.write(batch)
    }

    async fn discrepancies(&self, owner: &OwnerId) -> Result<Vec<Discrepancy>, StoreError> {
        self.scan_prefix(CF_DISCREPANCIES, &owner_prefix(owner))?
            .iter()
            .map(|(_, value)| decode(value))
            .collect()
    }

    async fn owners(&self) -> Result<Vec<OwnerId>, StoreError> {
        let mut set = BTreeSet::new();
        self.owner_keys(CF_BALANCES, &mut set)?;
        self.owner_keys(CF_ACTIVE_SESSIONS, &mut set)?;
        self.owner_keys(CF_LATEST_SESSIONS, &mut set)?;
        self.owner_keys(CF_OWNER_STAKE, &mut set)?;
        self.owner_keys(CF_ENTITLEMENTS, &mut set)?;
        for (key, _) in self.scan_prefix(CF_METADATA, META_EVENT_SEQ)? {
            set.insert(owner_from_bytes(&key[META_EVENT_SEQ.len()..])?);
        }
        let cf = self.cf_handle(CF_REFERRALS)?;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item.map_err(db_err)?;
            let edge: ReferralEdge = decode(&value)?;
            set.insert(edge.sponsor);
            set.insert(edge.referred);
        }
        Ok(set.into_iter().collect())
    }
}
