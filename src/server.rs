use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream},
    select,
};
use tracing::{info, warn};

use crate::message::{read_message, write_message, Request, Response};
use crate::relay::{Relay, RelayError};

pub struct RelayServer {
    listener: TcpListener,
    relay: Arc<Relay>,
}

impl RelayServer {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            relay: Arc::new(Relay::new()),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let RelayServer { listener, relay } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&relay).await;
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &relay);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn handle_shutdown(relay: &Arc<Relay>) {
    info!("relay shutting down");
    relay.close_all().await;
}

fn handle_accept_result(result: std::io::Result<(TcpStream, SocketAddr)>, relay: &Arc<Relay>) {
    match result {
        Ok((stream, peer)) => spawn_connection_handler(stream, peer, relay),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection_handler(stream: TcpStream, peer: SocketAddr, relay: &Arc<Relay>) {
    let relay = Arc::clone(relay);
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, relay).await {
            warn!(peer = %peer, error = ?err, "connection closed with error");
        }
    });
}

// Requests on one connection are handled strictly in order, one response
// each. A pending poll therefore parks the whole connection; clients that
// want to keep sending while they wait use a second connection for polling.
async fn handle_connection(stream: TcpStream, relay: Arc<Relay>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    while let Some(request) = read_message::<_, Request>(&mut reader).await? {
        let response = dispatch(&relay, request).await;
        write_message(&mut writer, &response).await?;
    }

    Ok(())
}

async fn dispatch(relay: &Relay, request: Request) -> Response {
    match request {
        Request::Register { client_id } => match relay.register(&client_id).await {
            Ok(messages) => Response::History { messages },
            Err(err) => error_response(err),
        },
        Request::Send { from, text } => match relay.send(&from, &text).await {
            Ok(()) => Response::Sent,
            Err(err) => error_response(err),
        },
        Request::Poll { client_id } => match relay.poll(&client_id).await {
            Ok(message) => Response::Message { message },
            Err(err) => error_response(err),
        },
        Request::Unregister { client_id } => Response::Unregistered {
            was_present: relay.unregister(&client_id).await,
        },
    }
}

fn error_response(err: RelayError) -> Response {
    Response::Error {
        kind: err.kind(),
        message: err.to_string(),
    }
}
