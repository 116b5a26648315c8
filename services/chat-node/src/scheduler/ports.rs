//! Free-port discovery for new rooms.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::ops::RangeInclusive;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::net::TcpListener;

/// Default range scanned for room ports.
pub const DEFAULT_PORT_RANGE: RangeInclusive<u16> = 34000..=34050;

/// Answers whether a port can currently be bound.
#[async_trait]
pub trait PortCheck: Send + Sync {
    async fn is_free(&self, port: u16) -> bool;
}

/// Checks by binding the wildcard address and releasing it immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpPortCheck;

#[async_trait]
impl PortCheck for TcpPortCheck {
    async fn is_free(&self, port: u16) -> bool {
        TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await.is_ok()
    }
}

/// In-memory port check for tests: every port is free unless marked busy.
#[derive(Debug, Default)]
pub struct MockPortCheck {
    busy: Mutex<HashSet<u16>>,
}

impl MockPortCheck {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check with the given ports already taken.
    pub fn with_busy(ports: impl IntoIterator<Item = u16>) -> Self {
        Self {
            busy: Mutex::new(ports.into_iter().collect()),
        }
    }
}

#[async_trait]
impl PortCheck for MockPortCheck {
    async fn is_free(&self, port: u16) -> bool {
        !self
            .busy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&port)
    }
}

/// First port in `range` that is neither reserved nor reported busy.
pub async fn find_free_port(
    checker: &dyn PortCheck,
    range: RangeInclusive<u16>,
    reserved: &HashSet<u16>,
) -> Option<u16> {
    for port in range {
        if reserved.contains(&port) {
            continue;
        }
        if checker.is_free(port).await {
            return Some(port);
        }
    }
    None
}
