/*
 * Copyright 2024 Google LLC
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::cluster::ClusterManager;
use crate::codec::ProtocolRegistry;
use crate::config::Config;
use crate::net::tcp::TcpConnectionFactory;
use crate::proxy::driver::run_downstream;
use crate::router::RouterConfig;

pub type ShutdownTx = watch::Sender<()>;
pub type ShutdownRx = watch::Receiver<()>;

pub fn shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    watch::channel(())
}

/// Binds the listener and services downstream connections until shutdown
/// is signalled.
pub async fn run(config: Config, mut shutdown_rx: ShutdownRx) -> crate::Result<()> {
    config.validate()?;

    let cluster_manager = ClusterManager::from_config(&config, Arc::new(TcpConnectionFactory));
    let router_config = Arc::new(RouterConfig::new(&config.routes));
    let protocols = Arc::new(ProtocolRegistry::default_protocols());

    let listener = TcpListener::bind(config.proxy.address).await?;
    tracing::info!(
        id = %config.proxy.id,
        address = %listener.local_addr()?,
        "listening for downstream connections"
    );

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!(%peer, "accepted downstream connection");
                        tokio::spawn(run_downstream(
                            stream,
                            Arc::clone(&router_config),
                            Arc::clone(&cluster_manager),
                            Arc::clone(&protocols),
                            shutdown_rx.clone(),
                        ));
                    }
                    Err(error) => tracing::warn!(%error, "failed to accept downstream connection"),
                }
            }
            _ = shutdown_rx.changed() => {
                tracing::info!("received shutdown signal, draining");
                cluster_manager.shutdown();
                return Ok(());
            }
        }
    }
}
