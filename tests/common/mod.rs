// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Shared setup for the end-to-end scenarios.

/// Brings the logging backend up once per test binary.
pub fn initialize() {
    ::weft::runtime::logging::initialize();
}
