//! The closed set of interaction operations carried by the envelopes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Operation identifies the type of interaction a message carries.
///
/// The wire representation is the lower-case operation string as used in WoT
/// profiles, e.g. `invokeaction` or `subscribeallevents`. The set is closed;
/// parsing any other string is a protocol mismatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    /// Invoke an action on a thing
    #[serde(rename = "invokeaction")]
    InvokeAction,
    /// Query the status of a single action
    #[serde(rename = "queryaction")]
    QueryAction,
    /// Query the status of all actions of a thing
    #[serde(rename = "queryallactions")]
    QueryAllActions,
    /// Cancel a queued or running action
    #[serde(rename = "cancelaction")]
    CancelAction,
    /// Write a property value
    #[serde(rename = "writeproperty")]
    WriteProperty,
    /// Write multiple property values in one request
    #[serde(rename = "writemultipleproperties")]
    WriteMultipleProperties,
    /// Start observing a property
    #[serde(rename = "observeproperty")]
    ObserveProperty,
    /// Start observing all properties of a thing
    #[serde(rename = "observeallproperties")]
    ObserveAllProperties,
    /// Stop observing a property
    #[serde(rename = "unobserveproperty")]
    UnobserveProperty,
    /// Stop observing all properties of a thing
    #[serde(rename = "unobserveallproperties")]
    UnobserveAllProperties,
    /// Read a property value
    #[serde(rename = "readproperty")]
    ReadProperty,
    /// Read all property values of a thing
    #[serde(rename = "readallproperties")]
    ReadAllProperties,
    /// Read a selection of property values
    #[serde(rename = "readmultipleproperties")]
    ReadMultipleProperties,
    /// Subscribe to an event
    #[serde(rename = "subscribeevent")]
    SubscribeEvent,
    /// Subscribe to all events of a thing
    #[serde(rename = "subscribeallevents")]
    SubscribeAllEvents,
    /// Unsubscribe from an event
    #[serde(rename = "unsubscribeevent")]
    UnsubscribeEvent,
    /// Unsubscribe from all events of a thing
    #[serde(rename = "unsubscribeallevents")]
    UnsubscribeAllEvents,
    /// Agent publishes an event
    #[serde(rename = "publishevent")]
    PublishEvent,
    /// Agent publishes a property value update
    #[serde(rename = "updateproperty")]
    UpdateProperty,
    /// Agent publishes multiple property value updates
    #[serde(rename = "updatemultipleproperties")]
    UpdateMultipleProperties,
    /// Agent publishes an updated TD document
    #[serde(rename = "updatetd")]
    UpdateTd,
    /// Read a TD document
    #[serde(rename = "readtd")]
    ReadTd,
    /// Read all TD documents
    #[serde(rename = "readalltds")]
    ReadAllTds,
    /// Connection liveness probe
    #[serde(rename = "ping")]
    Ping,
    /// Liveness probe answer
    #[serde(rename = "pong")]
    Pong,
    /// Authenticate with credentials
    #[serde(rename = "login")]
    Login,
    /// Invalidate the session
    #[serde(rename = "logout")]
    Logout,
    /// Exchange a valid token for a fresh one
    #[serde(rename = "refreshtoken")]
    RefreshToken,
}

impl Operation {
    /// The wire string of this operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::InvokeAction => "invokeaction",
            Operation::QueryAction => "queryaction",
            Operation::QueryAllActions => "queryallactions",
            Operation::CancelAction => "cancelaction",
            Operation::WriteProperty => "writeproperty",
            Operation::WriteMultipleProperties => "writemultipleproperties",
            Operation::ObserveProperty => "observeproperty",
            Operation::ObserveAllProperties => "observeallproperties",
            Operation::UnobserveProperty => "unobserveproperty",
            Operation::UnobserveAllProperties => "unobserveallproperties",
            Operation::ReadProperty => "readproperty",
            Operation::ReadAllProperties => "readallproperties",
            Operation::ReadMultipleProperties => "readmultipleproperties",
            Operation::SubscribeEvent => "subscribeevent",
            Operation::SubscribeAllEvents => "subscribeallevents",
            Operation::UnsubscribeEvent => "unsubscribeevent",
            Operation::UnsubscribeAllEvents => "unsubscribeallevents",
            Operation::PublishEvent => "publishevent",
            Operation::UpdateProperty => "updateproperty",
            Operation::UpdateMultipleProperties => "updatemultipleproperties",
            Operation::UpdateTd => "updatetd",
            Operation::ReadTd => "readtd",
            Operation::ReadAllTds => "readalltds",
            Operation::Ping => "ping",
            Operation::Pong => "pong",
            Operation::Login => "login",
            Operation::Logout => "logout",
            Operation::RefreshToken => "refreshtoken",
        }
    }

    /// Whether this operation mutates the event subscription set.
    pub fn is_subscription_op(&self) -> bool {
        matches!(
            self,
            Operation::SubscribeEvent
                | Operation::SubscribeAllEvents
                | Operation::UnsubscribeEvent
                | Operation::UnsubscribeAllEvents
        )
    }

    /// Whether this operation mutates the property observation set.
    pub fn is_observation_op(&self) -> bool {
        matches!(
            self,
            Operation::ObserveProperty
                | Operation::ObserveAllProperties
                | Operation::UnobserveProperty
                | Operation::UnobserveAllProperties
        )
    }

    /// Whether this operation is delivered as a notification rather than a
    /// request: events, property updates and TD updates published by agents.
    pub fn is_notification_op(&self) -> bool {
        matches!(
            self,
            Operation::PublishEvent
                | Operation::UpdateProperty
                | Operation::UpdateMultipleProperties
                | Operation::UpdateTd
                | Operation::Ping
                | Operation::Pong
        )
    }

    /// Operations that run during connection setup and must keep working
    /// while the connected flag is still false.
    pub fn runs_during_connect(&self) -> bool {
        matches!(self, Operation::Login | Operation::RefreshToken)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = crate::TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| crate::TransportError::protocol_mismatch(format!("unknown operation '{s}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_round_trip() {
        for op in [
            Operation::InvokeAction,
            Operation::SubscribeAllEvents,
            Operation::UnobserveAllProperties,
            Operation::RefreshToken,
            Operation::Pong,
        ] {
            let parsed: Operation = op.as_str().parse().unwrap();
            assert_eq!(parsed, op);
        }
    }

    #[test]
    fn unknown_operation_is_rejected() {
        assert!("explodething".parse::<Operation>().is_err());
    }

    #[test]
    fn families() {
        assert!(Operation::SubscribeAllEvents.is_subscription_op());
        assert!(Operation::UnobserveProperty.is_observation_op());
        assert!(Operation::PublishEvent.is_notification_op());
        assert!(!Operation::InvokeAction.is_notification_op());
        assert!(Operation::Login.runs_during_connect());
    }
}
