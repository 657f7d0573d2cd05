// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

/// Installs a `tracing` subscriber honoring `RUST_LOG`, so a failing test
/// run with `-- --nocapture` shows the forwarder's own logs. Safe to call
/// from every test; only the first call takes effect.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
