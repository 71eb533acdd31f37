//! `omapi send`: one request, one reply.

use crate::ui;
use omapi_types::{OmapiConfig, OmapiResult, Opcode, StatusCode};
use omapi_wire::{
    connect, disconnect, send_message, wait_timeout, Message, MessageHandler, Object,
    ProtocolContext, TypedData,
};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Collects replies as they arrive on the reader task.
#[derive(Default)]
struct ReplyCollector {
    replies: Mutex<Vec<Object>>,
}

impl MessageHandler for ReplyCollector {
    fn process(&self, message: &Object, _protocol: &Object) -> OmapiResult<()> {
        self.replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message.clone());
        Ok(())
    }
}

#[derive(Debug, Serialize, PartialEq)]
struct FieldView {
    name: String,
    value: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    hex: bool,
}

#[derive(Debug, Serialize)]
struct ReplyView {
    op: String,
    id: u32,
    rid: u32,
    handle: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<String>,
    values: Vec<FieldView>,
    object: Vec<FieldView>,
}

/// Printable text as-is, anything else hex-encoded.
fn field_view(name: &str, value: &TypedData) -> FieldView {
    let (value, hex) = match value {
        TypedData::Int(v) => (v.to_string(), false),
        TypedData::String(s) => (s.clone(), false),
        TypedData::Data(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) if text.chars().all(|c| !c.is_control()) => (text.to_string(), false),
            _ => (hex::encode(bytes), true),
        },
        TypedData::Object(object) => (format!("<{} handle {}>", object.type_name(), object.handle()), false),
    };
    FieldView {
        name: name.to_string(),
        value,
        hex,
    }
}

fn reply_view(message: &Message) -> ReplyView {
    let op = message.op();
    let result = message
        .value("result")
        .and_then(|v| v.as_u32())
        .map(|code| format!("{:?}", StatusCode::from_u32(code)));
    let object: Vec<FieldView> = message
        .object()
        .and_then(|o| {
            o.downcast_ref::<omapi_wire::GenericObject>()
                .map(|generic| {
                    generic
                        .names()
                        .into_iter()
                        .filter_map(|name| o.get_value(&name).ok().map(|v| field_view(&name, &v)))
                        .collect()
                })
        })
        .unwrap_or_default();
    ReplyView {
        op: Opcode::from_u32(op).map_or_else(|| op.to_string(), |o| o.name().to_string()),
        id: message.id(),
        rid: message.rid(),
        handle: message.handle(),
        result,
        values: message
            .values()
            .iter()
            .map(|(name, value)| field_view(name, value))
            .collect(),
        object,
    }
}

/// Numbers go out as integers, everything else as strings.
fn typed(value: &str) -> TypedData {
    match value.parse::<u32>() {
        Ok(number) => TypedData::Int(number),
        Err(_) => TypedData::from(value),
    }
}

fn build_request(op: Opcode, set: &[(String, String)], object: &[(String, String)]) -> OmapiResult<Object> {
    let message = Message::with_op(op);
    for (name, value) in set {
        message.set_value(name, typed(value))?;
    }
    if !object.is_empty() {
        let attached = Object::generic();
        for (name, value) in object {
            attached.set_value(name, typed(value))?;
        }
        message.set_value("object", TypedData::Object(attached))?;
    }
    Ok(message)
}

fn print_reply(view: &ReplyView, json: bool) {
    if json {
        match serde_json::to_string_pretty(view) {
            Ok(text) => println!("{text}"),
            Err(e) => ui::fail(&format!("Cannot encode reply: {e}")),
        }
        return;
    }
    ui::section(&format!("{} reply", view.op));
    ui::kv("id", &view.id.to_string());
    ui::kv("rid", &view.rid.to_string());
    ui::kv("handle", &view.handle.to_string());
    if let Some(result) = &view.result {
        ui::kv("result", result);
    }
    for field in view.values.iter().chain(&view.object) {
        let shown = if field.hex {
            format!("0x{}", field.value)
        } else {
            field.value.clone()
        };
        ui::kv(&field.name, &shown);
    }
}

#[allow(clippy::too_many_arguments)]
pub fn cmd_send(
    config: OmapiConfig,
    host: &str,
    port: Option<u16>,
    op: &str,
    set: &[(String, String)],
    object: &[(String, String)],
    timeout: u64,
    json: bool,
) {
    let op = Opcode::from_name(op).unwrap_or_else(|| ui::fail(&format!("Unknown opcode '{op}'")));
    let port = port.unwrap_or(config.listen_port);
    let timeout = Duration::from_secs(timeout);
    let request = build_request(op, set, object)
        .unwrap_or_else(|e| ui::fail(&format!("Invalid request: {e}")));

    let collector = Arc::new(ReplyCollector::default());
    let ctx = ProtocolContext::new(config, collector.clone());
    let rt = tokio::runtime::Runtime::new()
        .unwrap_or_else(|e| ui::fail(&format!("Failed to create Tokio runtime: {e}")));

    let caller = Object::generic();
    let protocol = rt
        .block_on(connect(&caller, host, port, &ctx, None))
        .unwrap_or_else(|e| ui::fail(&format!("Cannot connect to {host}:{port}: {e}")));

    // The reader tasks run on the runtime's workers; this thread just blocks.
    match wait_timeout(&caller, timeout) {
        Ok(true) => {}
        Ok(false) => ui::fail("Timed out waiting for the handshake"),
        Err(e) => ui::fail(&format!("Handshake failed: {e}")),
    }

    if let Err(e) = send_message(&protocol, &request, None, None) {
        ui::fail(&format!("Send failed: {e}"));
    }
    match wait_timeout(&caller, timeout) {
        Ok(true) => {}
        Ok(false) => ui::fail("Timed out waiting for the reply"),
        Err(e) => ui::fail(&format!("No reply: {e}")),
    }

    let replies = collector
        .replies
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone();
    for reply in &replies {
        if let Some(message) = reply.downcast_ref::<Message>() {
            print_reply(&reply_view(message), json);
        }
    }

    let _ = disconnect(&caller, false);
    drop(protocol);
    drop(caller);
}
