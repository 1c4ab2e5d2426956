//! ## ikewarden-engine::connection
//! **Supervisor for always-up named connections**
//!
//! ```text
//! Registered --check fires--> Checking --SA present--> Registered
//!                                      --SA absent---> Establishing (engine asked)
//! Establishing --check fires--> Checking ...
//! ```
//!
//! A connection's check reschedules itself before it looks at anything, so
//! from `setup` until `teardown` exactly one check is pending.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use tracing::{debug, error, info};

use ikewarden_config::{ConfigLookup, DEFAULT_CHECK_INTERVAL};
use ikewarden_core::{Scheduler, TimerHandle, Timestamp};
use ikewarden_telemetry::MetricsRecorder;

use crate::error::{DaemonError, Result};
use crate::exchange::{EstablishReason, EstablishRequest, ExchangeEngine};
use crate::registry::SaRegistry;
use crate::sa::Phase;
use crate::timer::TimerKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Registered,
    Checking,
    /// Negotiation handed to the exchange engine.
    Establishing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Registered => "registered",
            ConnectionState::Checking => "checking",
            ConnectionState::Establishing => "establishing",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub struct Connection {
    pub name: String,
    pub state: ConnectionState,
    check: Option<TimerHandle>,
}

impl Connection {
    pub fn next_check(&self) -> Option<Timestamp> {
        self.check.as_ref().map(TimerHandle::deadline)
    }
}

pub struct ConnectionSupervisor {
    connections: BTreeMap<String, Connection>,
    metrics: MetricsRecorder,
}

impl ConnectionSupervisor {
    pub fn new(metrics: MetricsRecorder) -> Self {
        Self {
            connections: BTreeMap::new(),
            metrics,
        }
    }

    /// Registers `name` and schedules an immediate first check.
    pub fn setup(
        &mut self,
        name: &str,
        scheduler: &mut Scheduler<TimerKind>,
        now: Timestamp,
    ) -> Result<()> {
        if self.connections.contains_key(name) {
            debug!("connection_setup: {name} already exists");
            return Err(DaemonError::Duplicate(format!("connection {name}")));
        }
        let check = match scheduler.schedule(
            "connection_checker",
            TimerKind::ConnectionCheck(name.to_owned()),
            now,
        ) {
            Ok(handle) => handle,
            Err(e) => {
                error!("connection_setup: cannot schedule first check for {name}: {e}");
                return Err(e.into());
            }
        };
        info!("connection_setup: {name}");
        self.connections.insert(
            name.to_owned(),
            Connection {
                name: name.to_owned(),
                state: ConnectionState::Registered,
                check: Some(check),
            },
        );
        Ok(())
    }

    /// Cancels the pending check and forgets `name`. Unknown names are ignored.
    pub fn teardown(&mut self, name: &str, scheduler: &mut Scheduler<TimerKind>) -> bool {
        let Some(mut conn) = self.connections.remove(name) else {
            return false;
        };
        if let Some(handle) = conn.check.take() {
            scheduler.cancel(handle);
        }
        info!("connection_teardown: {name}");
        true
    }

    /// Runs when a connection's check fires.
    pub fn periodic_check<E: ExchangeEngine + ?Sized>(
        &mut self,
        name: &str,
        scheduler: &mut Scheduler<TimerKind>,
        registry: &SaRegistry,
        engine: &mut E,
        settings: &dyn ConfigLookup,
        now: Timestamp,
    ) {
        let Some(conn) = self.connections.get_mut(name) else {
            debug!("connection_checker: {name} is gone");
            return;
        };
        conn.state = ConnectionState::Checking;
        self.metrics.connection_checks.inc();

        let interval = settings.get_num("general", "check_interval", DEFAULT_CHECK_INTERVAL);
        conn.check = match scheduler.schedule(
            "connection_checker",
            TimerKind::ConnectionCheck(name.to_owned()),
            now + Duration::from_secs(interval),
        ) {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!("connection_checker: could not reschedule {name}: {e}");
                None
            }
        };

        if registry.lookup_by_name(name, Phase::Two).is_some() {
            debug!("connection_checker: {name} has an SA");
            conn.state = ConnectionState::Registered;
            return;
        }
        if engine.lookup_by_name(name, Phase::Two) {
            debug!("connection_checker: {name} negotiation already running");
            conn.state = ConnectionState::Establishing;
            return;
        }
        debug!("connection_checker: establishing {name}");
        conn.state = ConnectionState::Establishing;
        engine.establish(EstablishRequest {
            name: name.to_owned(),
            phase: Phase::Two,
            reason: EstablishReason::Connection,
        });
    }

    pub fn get(&self, name: &str) -> Option<&Connection> {
        self.connections.get(name)
    }

    /// Connections in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
