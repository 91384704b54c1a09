// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Session registry
//!
//! One record per logically-connected device, reachable through three
//! indexes: session id, IMEI and connection handle. All three update under
//! a single write lock, so a mutation lands in all of them or none. The
//! lock is never held across I/O.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Opaque key into the connection manager.
pub type ConnectionHandle = u64;

/// Activity window used by [`RegistryStats::active`].
const ACTIVE_WINDOW: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub session_id: String,
    pub imei: String,
    pub connection: ConnectionHandle,
    pub remote_address: SocketAddr,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub authenticated: bool,
    pub device_variant: String,
    pub last_latitude: Option<f64>,
    pub last_longitude: Option<f64>,
    pub last_position_time: Option<DateTime<Utc>>,
    pub battery_percent: Option<u8>,
    pub charging: Option<bool>,
    pub ignition: Option<bool>,
    pub gsm_signal: Option<u8>,
    /// Monotonic activity mark driving eviction. Not serialized.
    #[serde(skip)]
    last_seen: Instant,
}

impl Session {
    fn new(imei: String, connection: ConnectionHandle, remote_address: SocketAddr) -> Session {
        let now = Utc::now();
        Session {
            session_id: Uuid::new_v4().to_string(),
            imei,
            connection,
            remote_address,
            created_at: now,
            last_activity_at: now,
            authenticated: true,
            device_variant: "UNKNOWN".to_string(),
            last_latitude: None,
            last_longitude: None,
            last_position_time: None,
            battery_percent: None,
            charging: None,
            ignition: None,
            gsm_signal: None,
            last_seen: Instant::now(),
        }
    }

    fn touch(&mut self) {
        self.last_activity_at = Utc::now();
        self.last_seen = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen.elapsed()
    }
}

/// Field-level status mutation, applied together with an activity touch.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub battery_percent: Option<u8>,
    pub charging: Option<bool>,
    pub ignition: Option<bool>,
    pub gsm_signal: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub authenticated: usize,
    pub with_location: usize,
    pub active: usize,
}

#[derive(Default)]
struct Indexes {
    by_id: HashMap<String, Session>,
    by_imei: HashMap<String, String>,
    by_connection: HashMap<ConnectionHandle, String>,
}

pub struct SessionRegistry {
    inner: RwLock<Indexes>,
    max_sessions: usize,
    idle_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize, idle_timeout: Duration) -> SessionRegistry {
        SessionRegistry {
            inner: RwLock::new(Indexes::default()),
            max_sessions,
            idle_timeout,
        }
    }

    /// Creates a session for `imei`, or rebinds the existing one to the new
    /// connection. At most one session per IMEI exists at any time.
    pub fn create_or_rebind(
        &self,
        imei: &str,
        connection: ConnectionHandle,
        remote_address: SocketAddr,
    ) -> Result<Session> {
        let mut inner = self.inner.write();
        if let Some(id) = inner.by_imei.get(imei).cloned() {
            let old_connection = inner.by_id[&id].connection;
            inner.by_connection.remove(&old_connection);
            inner.by_connection.insert(connection, id.clone());
            let session = inner.by_id.get_mut(&id).expect("imei index out of sync");
            session.connection = connection;
            session.remote_address = remote_address;
            session.authenticated = true;
            session.touch();
            return Ok(session.clone());
        }

        if inner.by_id.len() >= self.max_sessions {
            return Err(Error::Capacity(self.max_sessions));
        }

        let session = Session::new(imei.to_string(), connection, remote_address);
        inner
            .by_imei
            .insert(imei.to_string(), session.session_id.clone());
        inner
            .by_connection
            .insert(connection, session.session_id.clone());
        inner
            .by_id
            .insert(session.session_id.clone(), session.clone());
        Ok(session)
    }

    pub fn by_imei(&self, imei: &str) -> Option<Session> {
        let inner = self.inner.read();
        let id = inner.by_imei.get(imei)?;
        inner.by_id.get(id).cloned()
    }

    pub fn by_connection(&self, connection: ConnectionHandle) -> Option<Session> {
        let inner = self.inner.read();
        let id = inner.by_connection.get(&connection)?;
        inner.by_id.get(id).cloned()
    }

    pub fn by_id(&self, session_id: &str) -> Option<Session> {
        self.inner.read().by_id.get(session_id).cloned()
    }

    pub fn touch(&self, imei: &str) -> bool {
        self.with_session(imei, |session| session.touch())
    }

    pub fn update_position(
        &self,
        imei: &str,
        latitude: f64,
        longitude: f64,
        at: DateTime<Utc>,
    ) -> bool {
        self.with_session(imei, |session| {
            session.last_latitude = Some(latitude);
            session.last_longitude = Some(longitude);
            session.last_position_time = Some(at);
            session.touch();
        })
    }

    pub fn update_status(&self, imei: &str, update: StatusUpdate) -> bool {
        self.with_session(imei, |session| {
            if update.battery_percent.is_some() {
                session.battery_percent = update.battery_percent;
            }
            if update.charging.is_some() {
                session.charging = update.charging;
            }
            if update.ignition.is_some() {
                session.ignition = update.ignition;
            }
            if update.gsm_signal.is_some() {
                session.gsm_signal = update.gsm_signal;
            }
            session.touch();
        })
    }

    pub fn set_device_variant(&self, imei: &str, variant: &str) -> bool {
        self.with_session(imei, |session| {
            session.device_variant = variant.to_string();
            session.touch();
        })
    }

    fn with_session(&self, imei: &str, apply: impl FnOnce(&mut Session)) -> bool {
        let mut inner = self.inner.write();
        let id = match inner.by_imei.get(imei) {
            Some(id) => id.clone(),
            None => return false,
        };
        match inner.by_id.get_mut(&id) {
            Some(session) => {
                apply(session);
                true
            }
            None => false,
        }
    }

    /// Removes the session bound to `connection`, if that binding is still
    /// current. A session rebound to a newer connection survives its old
    /// connection's teardown.
    pub fn remove_by_connection(&self, connection: ConnectionHandle) -> Option<Session> {
        let mut inner = self.inner.write();
        let id = inner.by_connection.remove(&connection)?;
        let session = inner.by_id.remove(&id)?;
        inner.by_imei.remove(&session.imei);
        Some(session)
    }

    pub fn remove_by_imei(&self, imei: &str) -> Option<Session> {
        let mut inner = self.inner.write();
        let id = inner.by_imei.remove(imei)?;
        let session = inner.by_id.remove(&id)?;
        inner.by_connection.remove(&session.connection);
        Some(session)
    }

    /// Removes every session idle longer than the configured threshold and
    /// returns them so the caller can close connections and publish events.
    pub fn evict_idle(&self) -> Vec<Session> {
        let mut inner = self.inner.write();
        let expired: Vec<String> = inner
            .by_id
            .values()
            .filter(|s| s.idle_for() > self.idle_timeout)
            .map(|s| s.session_id.clone())
            .collect();
        let mut removed = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(session) = inner.by_id.remove(&id) {
                inner.by_imei.remove(&session.imei);
                inner.by_connection.remove(&session.connection);
                removed.push(session);
            }
        }
        removed
    }

    pub fn all(&self) -> Vec<Session> {
        self.inner.read().by_id.values().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn stats(&self) -> RegistryStats {
        let inner = self.inner.read();
        let sessions = inner.by_id.values();
        let mut stats = RegistryStats {
            total: inner.by_id.len(),
            authenticated: 0,
            with_location: 0,
            active: 0,
        };
        for session in sessions {
            if session.authenticated {
                stats.authenticated += 1;
            }
            if session.last_latitude.is_some() {
                stats.with_location += 1;
            }
            if session.idle_for() <= ACTIVE_WINDOW {
                stats.active += 1;
            }
        }
        stats
    }

    #[cfg(test)]
    fn assert_indexes_consistent(&self) {
        let inner = self.inner.read();
        assert_eq!(inner.by_id.len(), inner.by_imei.len());
        assert_eq!(inner.by_id.len(), inner.by_connection.len());
        for (imei, id) in &inner.by_imei {
            let session = &inner.by_id[id];
            assert_eq!(&session.imei, imei);
            assert_eq!(inner.by_connection[&session.connection], *id);
        }
    }
}
