//! Always-up connections.

use serde::{Deserialize, Serialize};
use validator::{self, Validate};

use crate::validation;

/// Phase-2 connections the daemon keeps established from startup.
#[derive(Default, Debug, Serialize, Deserialize, Validate, Clone, PartialEq)]
pub struct ConnectionsConfig {
    #[serde(default)]
    #[validate(custom(function = validation::validate_connection_names))]
    pub phase2: Vec<String>,
}
