// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Per-direction soft watermark: a reader stops requesting `Readable` once
/// its outbound buffer reaches this size, throttling it until the writer
/// drains below the watermark again.
pub const BUFFER_SOFT_CAP: usize = 8192;

/// A UDP client/upstream pair with no traffic for longer than this is
/// removed on the next idle sweep. Also the sweep cadence and the
/// dispatcher wait timeout for the UDP worker.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Fixed pool size for `TcpDataBridge` workers. Not a correctness property
/// (see `DESIGN.md`), just the static shard count new connections are
/// round-robined across.
pub const BRIDGE_COUNT: usize = 4;

/// Read bursts are capped at this size per wakeup, so a single very chatty
/// socket can't starve the rest of a bridge's pairs or balloon a buffer past
/// `BUFFER_SOFT_CAP` by more than one burst.
pub const READ_BURST_CAP: usize = 64 * 1024;
