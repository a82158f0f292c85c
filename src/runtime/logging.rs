// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::flexi_logger::{
    Logger,
    LoggerHandle,
};
use ::std::sync::OnceLock;

//======================================================================================================================
// Static Variables
//======================================================================================================================

/// Keeps the logger alive for the lifetime of the process; dropping the
/// handle would shut the backend down.
static LOGGER: OnceLock<Option<LoggerHandle>> = OnceLock::new();

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Initializes logging features. Safe to call from multiple tests or
/// threads; only the first call has any effect. Configuration comes from
/// `RUST_LOG`-style environment variables.
pub fn initialize() {
    LOGGER.get_or_init(|| match Logger::try_with_env() {
        Ok(logger) => logger.start().ok(),
        Err(_) => None,
    });
}
