//! WebSocket frame format: envelope JSON plus a `messageType` field.
//!
//! Frames carry the regular envelope fields with one extra `messageType`
//! member that tells the receiver which envelope to decode. The mapping
//! between operations and message types is a fixed table; unknown message
//! types are a protocol mismatch.

use serde_json::Value;
use wothub_messaging::{
    NotificationMessage, Operation, RequestMessage, ResponseMessage, TransportError,
    TransportResult,
};

/// The message type of every response frame.
pub const MSG_TYPE_ACTION_STATUS: &str = "actionStatus";

const MESSAGE_TYPE_FIELD: &str = "messageType";

/// The request frame message type for an operation.
pub fn message_type_for_request(op: Operation) -> &'static str {
    match op {
        Operation::InvokeAction => "invokeAction",
        Operation::QueryAction => "queryAction",
        Operation::QueryAllActions => "queryAllActions",
        Operation::CancelAction => "cancelAction",
        Operation::WriteProperty => "writeProperty",
        Operation::WriteMultipleProperties => "writeMultipleProperties",
        Operation::ObserveProperty => "observeProperty",
        Operation::ObserveAllProperties => "observeAllProperties",
        Operation::UnobserveProperty => "unobserveProperty",
        Operation::UnobserveAllProperties => "unobserveAllProperties",
        Operation::ReadProperty => "readProperty",
        Operation::ReadAllProperties => "readAllProperties",
        Operation::ReadMultipleProperties => "readMultipleProperties",
        Operation::SubscribeEvent => "subscribeEvent",
        Operation::SubscribeAllEvents => "subscribeAllEvents",
        Operation::UnsubscribeEvent => "unsubscribeEvent",
        Operation::UnsubscribeAllEvents => "unsubscribeAllEvents",
        Operation::ReadTd => "readTD",
        Operation::ReadAllTds => "readAllTDs",
        Operation::Ping => "ping",
        Operation::Login => "login",
        Operation::Logout => "logout",
        Operation::RefreshToken => "refreshToken",
        // notification-family operations never travel as requests; keep a
        // stable label anyway so encoding cannot fail
        Operation::PublishEvent => "event",
        Operation::UpdateProperty => "propertyReading",
        Operation::UpdateMultipleProperties => "propertyReadings",
        Operation::UpdateTd => "updateTD",
        Operation::Pong => "pong",
    }
}

/// The notification frame message type for an operation.
pub fn message_type_for_notification(op: Operation) -> &'static str {
    match op {
        Operation::PublishEvent => "event",
        Operation::UpdateProperty => "propertyReading",
        Operation::UpdateMultipleProperties => "propertyReadings",
        Operation::UpdateTd => "updateTD",
        Operation::Pong => "pong",
        _ => "ping",
    }
}

fn is_notification_type(mt: &str) -> bool {
    matches!(mt, "event" | "propertyReading" | "propertyReadings" | "updateTD" | "ping" | "pong")
}

fn with_message_type<T: serde::Serialize>(envelope: &T, mt: &str) -> TransportResult<String> {
    let mut v = serde_json::to_value(envelope)?;
    let obj = v
        .as_object_mut()
        .ok_or_else(|| TransportError::internal("envelope did not serialize to an object"))?;
    obj.insert(MESSAGE_TYPE_FIELD.to_string(), Value::String(mt.to_string()));
    Ok(v.to_string())
}

/// Encode a request as a frame.
pub fn encode_request(req: &RequestMessage) -> TransportResult<String> {
    with_message_type(req, message_type_for_request(req.operation))
}

/// Encode a response as a frame.
pub fn encode_response(resp: &ResponseMessage) -> TransportResult<String> {
    with_message_type(resp, MSG_TYPE_ACTION_STATUS)
}

/// Encode a notification as a frame.
pub fn encode_notification(notif: &NotificationMessage) -> TransportResult<String> {
    with_message_type(notif, message_type_for_notification(notif.operation))
}

/// An inbound frame, classified by its message type.
#[derive(Debug)]
pub enum WssInbound {
    /// A request frame
    Request(RequestMessage),
    /// A response frame
    Response(ResponseMessage),
    /// A notification frame
    Notification(NotificationMessage),
}

/// Decode a frame into the envelope its message type selects.
pub fn decode(text: &str) -> TransportResult<WssInbound> {
    let mut v: Value = serde_json::from_str(text)?;
    let obj = v
        .as_object_mut()
        .ok_or_else(|| TransportError::protocol_mismatch("frame is not a JSON object"))?;
    let mt = obj
        .remove(MESSAGE_TYPE_FIELD)
        .and_then(|m| m.as_str().map(str::to_string))
        .ok_or_else(|| TransportError::protocol_mismatch("frame has no messageType"))?;

    if mt == MSG_TYPE_ACTION_STATUS {
        return Ok(WssInbound::Response(serde_json::from_value(v)?));
    }
    if is_notification_type(&mt) {
        ensure_operation(obj, &mt)?;
        return Ok(WssInbound::Notification(serde_json::from_value(v)?));
    }
    ensure_operation(obj, &mt)?;
    Ok(WssInbound::Request(serde_json::from_value(v)?))
}

/// Older peers omit the operation field and rely on messageType alone;
/// backfill it from the table so the envelope decodes.
fn ensure_operation(obj: &mut serde_json::Map<String, Value>, mt: &str) -> TransportResult<()> {
    if obj.contains_key("operation") {
        return Ok(());
    }
    let op = operation_for_message_type(mt)
        .ok_or_else(|| TransportError::protocol_mismatch(format!("unknown messageType '{mt}'")))?;
    obj.insert("operation".to_string(), Value::String(op.as_str().to_string()));
    Ok(())
}

fn operation_for_message_type(mt: &str) -> Option<Operation> {
    let op = match mt {
        "invokeAction" => Operation::InvokeAction,
        "queryAction" => Operation::QueryAction,
        "queryAllActions" => Operation::QueryAllActions,
        "cancelAction" => Operation::CancelAction,
        "writeProperty" => Operation::WriteProperty,
        "writeMultipleProperties" => Operation::WriteMultipleProperties,
        "observeProperty" => Operation::ObserveProperty,
        "observeAllProperties" => Operation::ObserveAllProperties,
        "unobserveProperty" => Operation::UnobserveProperty,
        "unobserveAllProperties" => Operation::UnobserveAllProperties,
        "readProperty" => Operation::ReadProperty,
        "readAllProperties" => Operation::ReadAllProperties,
        "readMultipleProperties" => Operation::ReadMultipleProperties,
        "subscribeEvent" => Operation::SubscribeEvent,
        "subscribeAllEvents" => Operation::SubscribeAllEvents,
        "unsubscribeEvent" => Operation::UnsubscribeEvent,
        "unsubscribeAllEvents" => Operation::UnsubscribeAllEvents,
        "readTD" => Operation::ReadTd,
        "readAllTDs" => Operation::ReadAllTds,
        "ping" => Operation::Ping,
        "pong" => Operation::Pong,
        "login" => Operation::Login,
        "logout" => Operation::Logout,
        "refreshToken" => Operation::RefreshToken,
        "event" => Operation::PublishEvent,
        "propertyReading" => Operation::UpdateProperty,
        "propertyReadings" => Operation::UpdateMultipleProperties,
        "updateTD" => Operation::UpdateTd,
        _ => return None,
    };
    Some(op)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_frame_round_trip() {
        let req = RequestMessage::new(Operation::InvokeAction, "t1", "a1", Some(json!(3)), "c-1");
        let frame = encode_request(&req).unwrap();
        assert!(frame.contains("\"messageType\":\"invokeAction\""));
        match decode(&frame).unwrap() {
            WssInbound::Request(r) => {
                assert_eq!(r.operation, Operation::InvokeAction);
                assert_eq!(r.correlation_id, "c-1");
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn response_frame_is_action_status() {
        let req = RequestMessage::new(Operation::InvokeAction, "t1", "a1", None, "c-2");
        let resp = req.create_response(Some(json!("ok")), None);
        let frame = encode_response(&resp).unwrap();
        assert!(frame.contains(MSG_TYPE_ACTION_STATUS));
        assert!(matches!(decode(&frame).unwrap(), WssInbound::Response(_)));
    }

    #[test]
    fn notification_frame_types() {
        let notif = NotificationMessage::new(Operation::UpdateProperty, "t1", "p1", Some(json!(7)));
        let frame = encode_notification(&notif).unwrap();
        assert!(frame.contains("\"messageType\":\"propertyReading\""));
        assert!(matches!(decode(&frame).unwrap(), WssInbound::Notification(_)));
    }

    #[test]
    fn operation_backfilled_from_message_type() {
        let frame = json!({
            "messageType": "subscribeEvent",
            "thingId": "t1",
            "name": "e1",
            "correlationId": "c-3",
        })
        .to_string();
        match decode(&frame).unwrap() {
            WssInbound::Request(r) => assert_eq!(r.operation, Operation::SubscribeEvent),
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let frame = json!({ "messageType": "explode" }).to_string();
        assert!(decode(&frame).is_err());
    }
}
