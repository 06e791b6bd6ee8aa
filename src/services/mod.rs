//! Service lifecycle management
//!
//! Long-running work is packaged as services started and stopped by a single
//! manager around one shared shutdown Notify. Tasks never block each other:
//! each service spawns its own tokio tasks and sleeps cooperatively via
//! `utils::check_shutdown_or_delay`, so the process stops cleanly.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::logger::{self, LogTag};

/// Core service trait that all services must implement
#[async_trait]
pub trait Service: Send + Sync {
    /// Unique service identifier
    fn name(&self) -> &'static str;

    /// Service priority (lower = starts earlier, stops later)
    fn priority(&self) -> i32 {
        100
    }

    /// Initialize the service
    async fn initialize(&mut self) -> Result<(), String> {
        Ok(())
    }

    /// Start the service, returning its spawned task handles
    async fn start(&mut self, shutdown: Arc<Notify>) -> Result<Vec<JoinHandle<()>>, String>;

    /// Stop the service
    async fn stop(&mut self) -> Result<(), String> {
        Ok(())
    }
}

pub struct ServiceManager {
    services: Vec<Box<dyn Service>>,
    handles: HashMap<&'static str, Vec<JoinHandle<()>>>,
    shutdown: Arc<Notify>,
}

impl ServiceManager {
    pub fn new() -> Self {
        Self {
            services: Vec::new(),
            handles: HashMap::new(),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Handle other components can use to request shutdown
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Register a service
    pub fn register(&mut self, service: Box<dyn Service>) {
        self.services.push(service);
    }

    /// Start all services in priority order
    pub async fn start_all(&mut self) -> Result<(), String> {
        logger::info(LogTag::System, "Starting all services...");
        self.services.sort_by_key(|s| s.priority());

        for service in self.services.iter_mut() {
            let name = service.name();
            logger::info(LogTag::System, &format!("Initializing service: {}", name));
            service.initialize().await?;

            logger::info(LogTag::System, &format!("Starting service: {}", name));
            let handles = service.start(self.shutdown.clone()).await?;
            self.handles.insert(name, handles);
            logger::info(LogTag::System, &format!("Service started: {}", name));
        }

        logger::info(LogTag::System, "All services started successfully");
        Ok(())
    }

    /// Signal shutdown and wait for every task to finish
    pub async fn stop_all(&mut self) {
        logger::info(LogTag::System, "Stopping all services...");
        self.shutdown.notify_waiters();

        for service in self.services.iter_mut().rev() {
            if let Err(e) = service.stop().await {
                logger::warning(
                    LogTag::System,
                    &format!("Service {} stop error: {}", service.name(), e),
                );
            }
        }

        for (name, handles) in self.handles.drain() {
            for handle in handles {
                if let Err(e) = handle.await {
                    logger::warning(
                        LogTag::System,
                        &format!("Service {} task join error: {}", name, e),
                    );
                }
            }
        }
        logger::info(LogTag::System, "All services stopped");
    }
}
