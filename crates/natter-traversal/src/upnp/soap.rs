//! UPnP SOAP command client
//!
//! Formats a SOAP envelope for an action, POSTs it to the device's control
//! URL on a fresh connection and returns the reply body. Interpreting the
//! reply (a [`NameValueList`](super::igd::NameValueList) plus its
//! `errorCode`) is left to the typed commands in [`super::commands`].

use super::http::{self, HttpError, HttpUrl};
use crate::task::OperationHandle;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Reply buffer capacity for SOAP commands
pub const COMMAND_BUFFER_SIZE: usize = 4096;

/// Overall deadline for a SOAP command
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(15);

/// Well-known UPnP error codes
#[derive(Debug, Clone, Copy)]
pub struct UpnpErrorCode;

impl UpnpErrorCode {
    /// Invalid or missing arguments
    pub const INVALID_ARGS: i32 = 402;
    /// Action failed
    pub const ACTION_FAILED: i32 = 501;
    /// No such entry in the port mapping array
    pub const NO_SUCH_ENTRY: i32 = 714;
    /// Mapping conflicts with an existing one
    pub const CONFLICT_IN_MAPPING: i32 = 718;
    /// Reply unusable or error code not numeric
    pub const UNKNOWN_ERROR: i32 = -1;

    /// Short description of `code`
    #[must_use]
    pub fn describe(code: i32) -> &'static str {
        match code {
            401 => "Invalid Action",
            Self::INVALID_ARGS => "Invalid Args",
            Self::ACTION_FAILED => "Action Failed",
            606 => "Action not authorized",
            Self::NO_SUCH_ENTRY => "NoSuchEntryInArray",
            715 => "WildCardNotPermittedInSrcIP",
            716 => "WildCardNotPermittedInExtPort",
            Self::CONFLICT_IN_MAPPING => "ConflictInMappingEntry",
            724 => "SamePortValuesRequired",
            725 => "OnlyPermanentLeasesSupported",
            726 => "RemoteHostOnlySupportsWildcard",
            727 => "ExternalPortOnlySupportsWildcard",
            _ => "Unknown error",
        }
    }
}

/// SOAP command error types
#[derive(Debug, Error)]
pub enum SoapError {
    /// Transport failure: bad URL, connection, timeout
    #[error("HTTP error: {0}")]
    Http(#[from] HttpError),

    /// The device answered with a UPnP error code
    #[error("UPnP error {0}")]
    Upnp(i32),
}

impl SoapError {
    /// Numeric code in the style of the UPnP API; transport failures map to
    /// [`UpnpErrorCode::UNKNOWN_ERROR`]
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::Http(_) => UpnpErrorCode::UNKNOWN_ERROR,
            Self::Upnp(code) => *code,
        }
    }
}

/// Settings shared by all SOAP commands
#[derive(Debug, Clone)]
pub struct CommandConfig {
    /// Deadline for connect, send and receive together
    pub timeout: Duration,
    /// Reply buffer capacity; longer replies are truncated
    pub capacity: usize,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            timeout: COMMAND_TIMEOUT,
            capacity: COMMAND_BUFFER_SIZE,
        }
    }
}

/// Escape the characters that would break an element value or a quoted
/// attribute
fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Build the SOAP envelope for `action` of `service_type`
///
/// Arguments become `<name>value</name>` children in order; without
/// arguments the action element is self-closing.
#[must_use]
pub fn build_envelope(action: &str, service_type: &str, args: &[(&str, &str)]) -> String {
    let mut body = String::from(
        "<?xml version=\"1.0\"?>\r\n\
         <s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\" \
         s:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\">\
         <s:Body>",
    );

    let service_type = escape(service_type);
    if args.is_empty() {
        body.push_str(&format!("<u:{action} xmlns:u=\"{service_type}\"/>"));
    } else {
        body.push_str(&format!("<u:{action} xmlns:u=\"{service_type}\">"));
        for (name, value) in args {
            body.push_str(&format!("<{name}>{}</{name}>", escape(value)));
        }
        body.push_str(&format!("</u:{action}>"));
    }

    body.push_str("</s:Body></s:Envelope>\r\n");
    body
}

/// Issues SOAP actions against IGD control URLs
///
/// Cheap to clone; every command opens and tears down its own connection.
#[derive(Debug, Clone, Default)]
pub struct SoapClient {
    config: CommandConfig,
}

impl SoapClient {
    /// Create a client with explicit settings
    #[must_use]
    pub fn new(config: CommandConfig) -> Self {
        Self { config }
    }

    /// Active settings
    #[must_use]
    pub fn config(&self) -> &CommandConfig {
        &self.config
    }

    /// POST `action` to `control_url` and return the reply body
    ///
    /// # Errors
    ///
    /// Fails with [`SoapError::Http`] when the URL is not `http://`, the
    /// connection fails or the deadline expires. UPnP error replies are
    /// returned as `Ok` for the caller to inspect.
    pub async fn send_command(
        &self,
        control_url: &str,
        service_type: &str,
        action: &str,
        args: &[(&str, &str)],
    ) -> Result<Vec<u8>, SoapError> {
        let url = HttpUrl::parse(control_url)?;
        let body = build_envelope(action, service_type, args);
        let soap_action = format!("{service_type}#{action}");

        debug!("Sending UPnP command {} to {}", action, url);
        let reply = http::post_soap(
            &url,
            &soap_action,
            &body,
            self.config.capacity,
            self.config.timeout,
        )
        .await
        .inspect_err(|e| warn!("UPnP command {} to {} failed: {}", action, control_url, e))?;
        Ok(reply)
    }

    /// Run [`SoapClient::send_command`] in the background
    ///
    /// `on_reply` receives the reply body, or an empty buffer on failure.
    pub fn spawn_command<C>(
        &self,
        control_url: impl Into<String>,
        service_type: impl Into<String>,
        action: impl Into<String>,
        args: Vec<(String, String)>,
        on_reply: C,
    ) -> OperationHandle
    where
        C: FnOnce(Vec<u8>) + Send + 'static,
    {
        let client = self.clone();
        let control_url = control_url.into();
        let service_type = service_type.into();
        let action = action.into();
        OperationHandle::spawn(
            async move {
                let args: Vec<(&str, &str)> = args
                    .iter()
                    .map(|(n, v)| (n.as_str(), v.as_str()))
                    .collect();
                client
                    .send_command(&control_url, &service_type, &action, &args)
                    .await
                    .unwrap_or_default()
            },
            on_reply,
        )
    }
}
