/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * HybridDB - Primary/replica document database access layer
 * Built with Rust for superior performance and reliability
 *
 * @file shutdown.rs
 * @brief Signal handling and shutdown notification
 */

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    Signal(i32),
    Request,
}

impl ShutdownReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Signal(_) => "signal",
            Self::Request => "request",
        }
    }
}

#[derive(Debug)]
pub struct ShutdownManager {
    shutdown_tx: broadcast::Sender<ShutdownReason>,
    is_shutting_down: AtomicBool,
    shutdown_reason: Mutex<Option<ShutdownReason>>,
    shutdown_started: Mutex<Option<Instant>>,
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            shutdown_tx,
            is_shutting_down: AtomicBool::new(false),
            shutdown_reason: Mutex::new(None),
            shutdown_started: Mutex::new(None),
        }
    }

    pub fn start_signal_handling(&self) {
        #[cfg(unix)]
        {
            let shutdown_tx = self.shutdown_tx.clone();
            tokio::spawn(async move {
                let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(signal) => signal,
                    Err(e) => {
                        error!("Failed to register SIGTERM handler: {}", e);
                        return;
                    }
                };
                if sigterm.recv().await.is_some() {
                    info!("Received SIGTERM, initiating graceful shutdown");
                    let _ = shutdown_tx.send(ShutdownReason::Signal(15));
                }
            });
        }

        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received SIGINT, initiating graceful shutdown");
                    let _ = shutdown_tx.send(ShutdownReason::Signal(2));
                }
                Err(e) => error!("Failed to wait for SIGINT: {}", e),
            }
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    pub fn shutdown_reason(&self) -> Option<ShutdownReason> {
        self.shutdown_reason.lock().clone()
    }

    pub fn shutdown_started(&self) -> Option<Instant> {
        *self.shutdown_started.lock()
    }

    pub fn initiate_shutdown(&self, reason: ShutdownReason) {
        if self.is_shutting_down.swap(true, Ordering::SeqCst) {
            debug!("Shutdown already in progress");
            return;
        }
        *self.shutdown_reason.lock() = Some(reason.clone());
        *self.shutdown_started.lock() = Some(Instant::now());

        info!("Initiating graceful shutdown: {:?}", reason);
        let _ = self.shutdown_tx.send(reason);
    }

    pub async fn wait_for_shutdown(&self) -> ShutdownReason {
        let mut rx = self.subscribe();
        if let Some(reason) = self.shutdown_reason() {
            return reason;
        }
        let reason = rx.recv().await.unwrap_or(ShutdownReason::Request);
        self.initiate_shutdown(reason.clone());
        reason
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_shutdown_manager() {
        let manager = ShutdownManager::new();

        assert!(!manager.is_shutting_down());
        assert!(manager.shutdown_reason().is_none());

        manager.initiate_shutdown(ShutdownReason::Request);
        manager.initiate_shutdown(ShutdownReason::Signal(15));

        assert!(manager.is_shutting_down());
        assert_eq!(manager.shutdown_reason(), Some(ShutdownReason::Request));
        assert!(manager.shutdown_started().is_some());
    }

    #[tokio::test]
    async fn test_shutdown_subscription() {
        let manager = Arc::new(ShutdownManager::new());
        let waiter = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.wait_for_shutdown().await })
        };
        tokio::task::yield_now().await;

        let mut rx = manager.subscribe();
        manager.initiate_shutdown(ShutdownReason::Signal(15));

        assert_eq!(rx.recv().await.unwrap(), ShutdownReason::Signal(15));
        assert_eq!(waiter.await.unwrap(), ShutdownReason::Signal(15));
    }
}
