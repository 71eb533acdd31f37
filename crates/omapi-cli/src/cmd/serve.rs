//! `omapi serve`: a protocol listener that acknowledges every request.

use crate::ui;
use omapi_types::{OmapiConfig, OmapiError, OmapiResult, Opcode, StatusCode};
use omapi_wire::{protocol_listen, send_status, Listener, Message, MessageHandler, Object, ProtocolContext};
use std::sync::Arc;
use tracing::info;

/// Logs each inbound message and answers it with STATUS Success.
pub struct Acknowledger;

impl MessageHandler for Acknowledger {
    fn process(&self, message: &Object, protocol: &Object) -> OmapiResult<()> {
        let request = message
            .downcast_ref::<Message>()
            .ok_or_else(|| OmapiError::InvalidArgument("not a message".into()))?;
        let op = request.op();
        let name = Opcode::from_u32(op).map_or("unknown", Opcode::name);
        info!(
            op,
            id = request.id(),
            handle = request.handle(),
            values = request.values().len(),
            "OMAPI: received {} message",
            name
        );
        if op == Opcode::Status.as_u32() {
            return Ok(());
        }
        send_status(protocol, StatusCode::Success, request.id(), Some("ok"))
    }
}

pub fn cmd_serve(config: OmapiConfig, port: Option<u16>, backlog: Option<u32>) {
    let port = port.unwrap_or(config.listen_port);
    let backlog = backlog.unwrap_or(config.backlog);
    let ctx = ProtocolContext::new(config, Arc::new(Acknowledger));

    let rt = tokio::runtime::Runtime::new()
        .unwrap_or_else(|e| ui::fail(&format!("Failed to create Tokio runtime: {e}")));
    rt.block_on(async {
        let server = Object::generic();
        let listener = match protocol_listen(&server, port, backlog, &ctx).await {
            Ok(listener) => listener,
            Err(e) => ui::fail(&format!("Cannot listen on port {port}: {e}")),
        };
        let address = listener
            .downcast_ref::<Listener>()
            .and_then(Listener::local_addr)
            .map_or_else(|| format!("port {port}"), |addr| addr.to_string());
        ui::success(&format!("Listening on {address} (Ctrl+C to stop)"));

        if let Err(e) = tokio::signal::ctrl_c().await {
            ui::error(&format!("Cannot wait for Ctrl+C: {e}"));
        }
        info!("OMAPI: shutting down");
        drop(listener);
        drop(server);
    });
}
