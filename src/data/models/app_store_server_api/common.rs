#![allow(dead_code)]

use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub(crate) enum Environment {
    Sandbox,
    Production,
    #[serde(untagged)]
    Unknown(String),
}
