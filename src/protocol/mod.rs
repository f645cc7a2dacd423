//! JSON socket protocol for Basalt
//!
//! Framing is `u32 BE length || UTF-8 JSON` in both directions. One
//! `ConnectionHandler` runs per accepted socket: a reader loop processes
//! requests serially while a writer task drains a per-connection response
//! channel. The channel is the key to the retry machinery: the retry
//! dispatcher holds a sender clone and can push an unsolicited follow-up
//! response (`retried: true`) after the connection's own traffic, without
//! the two writers interleaving bytes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::error::{BasaltError, Result};
use crate::processor::{QueryProcessor, StatementOutcome};

pub mod frame;
pub mod message;
pub mod retry;

pub use message::{Request, Response};
pub use retry::{RetryItem, RetryQueue};

/// Live connections, addressable by the retry dispatcher.
pub struct ClientRegistry {
    next_id: AtomicU64,
    senders: Mutex<HashMap<u64, mpsc::UnboundedSender<Response>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            senders: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, sender: mpsc::UnboundedSender<Response>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.senders
            .lock()
            .expect("client registry mutex poisoned")
            .insert(id, sender);
        id
    }

    pub fn unregister(&self, id: u64) {
        self.senders
            .lock()
            .expect("client registry mutex poisoned")
            .remove(&id);
    }

    pub fn sender(&self, id: u64) -> Option<mpsc::UnboundedSender<Response>> {
        self.senders
            .lock()
            .expect("client registry mutex poisoned")
            .get(&id)
            .cloned()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Handles a single client connection
pub struct ConnectionHandler {
    processor: Arc<QueryProcessor>,
    retry_queue: Arc<RetryQueue>,
    clients: Arc<ClientRegistry>,
}

impl ConnectionHandler {
    pub fn new(
        processor: Arc<QueryProcessor>,
        retry_queue: Arc<RetryQueue>,
        clients: Arc<ClientRegistry>,
    ) -> Self {
        Self {
            processor,
            retry_queue,
            clients,
        }
    }

    /// Run the connection to completion.
    pub async fn run(self, stream: TcpStream) -> Result<()> {
        let (mut read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Response>();
        let client_id = self.clients.register(tx.clone());

        // Single writer: everything this client receives flows through the
        // channel, including dispatcher follow-ups.
        let writer = tokio::spawn(async move {
            while let Some(response) = rx.recv().await {
                let body = match serde_json::to_vec(&response) {
                    Ok(body) => body,
                    Err(e) => {
                        warn!("response encode failed: {}", e);
                        continue;
                    }
                };
                if frame::write_frame(&mut write_half, &body).await.is_err() {
                    break;
                }
            }
        });

        let result = self.serve_client(&mut read_half, &tx, client_id).await;

        self.clients.unregister(client_id);
        drop(tx);
        let _ = writer.await;
        debug!("client {} finished", client_id);
        result
    }

    async fn serve_client(
        &self,
        read_half: &mut tokio::net::tcp::OwnedReadHalf,
        tx: &mpsc::UnboundedSender<Response>,
        client_id: u64,
    ) -> Result<()> {
        loop {
            let body = match frame::read_frame(read_half).await? {
                Some(body) => body,
                None => return Ok(()), // clean disconnect
            };

            let request: Request = match serde_json::from_slice(&body) {
                Ok(request) => request,
                Err(e) => {
                    // Unknown type or malformed body: report and close.
                    let _ = tx.send(Response::failure(format!("bad request: {}", e)));
                    return Err(BasaltError::Protocol(e.to_string()));
                }
            };

            let response = self.handle_request(request, client_id);
            if tx.send(response).is_err() {
                return Ok(());
            }
        }
    }

    fn handle_request(&self, request: Request, client_id: u64) -> Response {
        match request {
            Request::Begin => match self.processor.begin_transaction() {
                Ok(txid) => Response {
                    success: true,
                    transaction_id: Some(txid),
                    ..Default::default()
                },
                Err(e) => Response::failure(e.to_string()),
            },
            Request::Execute {
                query,
                transaction_id,
            } => match self.processor.execute_query(&query, transaction_id) {
                StatementOutcome::Done(result) => Response::from(result),
                StatementOutcome::Blocked {
                    txid,
                    blocked_by,
                    auto_commit,
                } => {
                    self.retry_queue.push(RetryItem {
                        client_id,
                        txid,
                        query,
                        auto_commit,
                        event: self.processor.ccm().wait_event(txid),
                    });
                    let reason = match blocked_by {
                        Some(holder) => format!("lock held by transaction {}", holder),
                        None => "lock conflict".to_string(),
                    };
                    let mut response = Response::queued(reason);
                    response.transaction_id = Some(txid);
                    response
                }
            },
            Request::Commit { transaction_id } => {
                Response::from(self.processor.commit_transaction(transaction_id))
            }
            Request::Rollback { transaction_id } => {
                // Processed even while retries are pending: abort signals
                // the transaction's event, and the woken retry resolves to
                // an aborted-transaction failure response.
                Response::from(self.processor.rollback_transaction(transaction_id))
            }
            Request::Analyze { table_name } => {
                Response::from(self.processor.analyze_table(&table_name))
            }
            Request::Defragment { table_name } => {
                Response::from(self.processor.defragment_table(&table_name))
            }
        }
    }
}

/// Accept loop plus the retry dispatcher task.
pub async fn serve(listener: tokio::net::TcpListener, processor: Arc<QueryProcessor>) -> Result<()> {
    let retry_queue = Arc::new(RetryQueue::new());
    let clients = Arc::new(ClientRegistry::new());

    tokio::spawn(retry::run_dispatcher(
        Arc::clone(&retry_queue),
        Arc::clone(&processor),
        Arc::clone(&clients),
    ));

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("new connection from {}", addr);
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("failed to set TCP_NODELAY for {}: {}", addr, e);
                }

                let handler = ConnectionHandler::new(
                    Arc::clone(&processor),
                    Arc::clone(&retry_queue),
                    Arc::clone(&clients),
                );
                tokio::spawn(async move {
                    if let Err(e) = handler.run(stream).await {
                        warn!("connection error from {}: {}", addr, e);
                    }
                    info!("connection closed: {}", addr);
                });
            }
            Err(e) => {
                warn!("failed to accept connection: {}", e);
            }
        }
    }
}
