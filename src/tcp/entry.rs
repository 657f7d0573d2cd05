// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;

/// A routing table entry for one locally-listening TCP port: where new
/// connections accepted on it should be forwarded.
#[derive(Clone, Debug)]
pub struct TcpEntry {
    pub remote: SocketAddr,
}
