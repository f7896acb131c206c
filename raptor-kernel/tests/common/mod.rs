#![allow(dead_code)]

use raptor_bus::MessageBus;
use raptor_devkit::RecordingBus;
use raptor_kernel::config::{AllocationSeed, KernelConfig, NodeSeed};
use raptor_kernel::hub::{Hub, HubStats};
use raptor_kernel::models::{NewServer, Server};
use raptor_kernel::store::{FileStore, RecordStore};
use raptor_kernel::Services;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub const API_KEY: &str = "test-key";
pub const OWNER: u64 = 7;

pub struct Kernel {
    pub services: Services,
    pub store: Arc<FileStore>,
    pub bus: RecordingBus,
    pub shutdown: CancellationToken,
}

impl Kernel {
    /// One node (id 1) offering `ports`.
    pub fn start(ports: &[u16]) -> Kernel {
        Kernel::with_nodes(&[ports])
    }

    /// Node `i + 1` offers `ports_per_node[i]`.
    pub fn with_nodes(ports_per_node: &[&[u16]]) -> Kernel {
        let nodes = ports_per_node
            .iter()
            .enumerate()
            .map(|(index, ports)| {
                let ip = format!("10.0.0.{}", index + 1);
                NodeSeed {
                    name: format!("node-{}", index + 1),
                    hostname: format!("node{}.lan", index + 1),
                    ip: ip.clone(),
                    port: 8080,
                    total_ram: 0,
                    total_cpu: 0,
                    total_disk: 0,
                    allocations: vec![AllocationSeed {
                        ip,
                        ports: ports.to_vec(),
                    }],
                }
            })
            .collect();
        let config = KernelConfig {
            api_key: Some(API_KEY.into()),
            nodes,
            ..KernelConfig::default()
        };

        let store = Arc::new(FileStore::in_memory());
        store.seed_nodes(&config.nodes);
        let bus = RecordingBus::new();
        let shutdown = CancellationToken::new();
        let bus_arc: Arc<dyn MessageBus> = Arc::new(bus.clone());
        let services = Services::spawn(&config, store.clone(), bus_arc, shutdown.clone());

        Kernel {
            services,
            store,
            bus,
            shutdown,
        }
    }

    pub fn hub(&self) -> &Hub {
        &self.services.state.hub
    }

    pub fn create_server(&self) -> Server {
        self.create_server_on(1)
    }

    pub fn create_server_on(&self, node_id: u64) -> Server {
        self.store
            .create_server(
                OWNER,
                NewServer {
                    name: "survival".into(),
                    node_id,
                    image: "itzg/minecraft-server".into(),
                    limits: Default::default(),
                },
            )
            .expect("allocation available")
    }

    /// Burns record ids until the next created server gets `id`.
    pub fn create_server_with_id(&self, id: u64) -> Server {
        loop {
            let server = self.create_server();
            if server.id == id {
                return server;
            }
            assert!(server.id < id, "id {id} already used");
            self.store.delete_server(server.id).expect("just created");
        }
    }

    /// Serves the router on an ephemeral port until shutdown.
    pub async fn serve(&self) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        self.serve_with(listener)
    }

    /// Serves on `addr`, waiting for a previous kernel to release it.
    pub async fn serve_at(&self, addr: SocketAddr) -> SocketAddr {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            match TcpListener::bind(addr).await {
                Ok(listener) => return self.serve_with(listener),
                Err(_) if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                Err(e) => panic!("could not rebind {addr}: {e}"),
            }
        }
    }

    fn serve_with(&self, listener: TcpListener) -> SocketAddr {
        let addr = listener.local_addr().expect("local addr");
        let app = raptor_kernel::http::build_router(self.services.state.clone());
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await;
        });
        addr
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Polls the hub until `check` accepts its stats.
pub async fn wait_for_hub(hub: &Hub, check: impl Fn(HubStats) -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if hub.stats().await.is_ok_and(&check) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
