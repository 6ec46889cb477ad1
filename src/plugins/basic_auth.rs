use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use http::{header, StatusCode};
use pingora_error::Result;
use pingora_proxy::Session;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use validator::Validate;

use crate::{
    core::{constant_time_eq, ProxyContext, ProxyError, ProxyPlugin, ProxyResult},
    proxy::consumer,
    utils::{request, response::ResponseBuilder},
};

pub const PLUGIN_NAME: &str = "basic-auth";
const PRIORITY: i32 = 2520;

/// Creates a Basic Auth plugin instance.
pub fn create_basic_auth_plugin(cfg: JsonValue) -> ProxyResult<Arc<dyn ProxyPlugin>> {
    let config = PluginConfig::try_from(cfg)?;
    Ok(Arc::new(PluginBasicAuth { config }))
}

/// `username`/`password` are optional: when a route/service configures this
/// plugin without credentials, it falls back to looking the decoded username
/// up against consumers' basic-auth credentials instead.
#[derive(Debug, Serialize, Deserialize, Validate)]
struct PluginConfig {
    #[validate(length(min = 1))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    #[validate(length(min = 1))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    password: Option<String>,
    #[serde(default)]
    hide_credentials: bool,
}

impl TryFrom<JsonValue> for PluginConfig {
    type Error = ProxyError;

    fn try_from(value: JsonValue) -> Result<Self, Self::Error> {
        let config: PluginConfig = serde_json::from_value(value).map_err(|e| {
            ProxyError::serialization_error("Failed to parse basic auth plugin config", e)
        })?;
        config.validate()?;
        Ok(config)
    }
}

pub struct PluginBasicAuth {
    config: PluginConfig,
}

impl PluginBasicAuth {
    /// Decodes a `Basic <base64>` Authorization header value into its
    /// `(username, password)` pair.
    fn decode_credentials(auth_value: &str) -> Option<(String, String)> {
        if !auth_value.to_lowercase().starts_with("basic ") {
            return None;
        }

        let credential_part = &auth_value[6..];
        let decoded_bytes = general_purpose::STANDARD.decode(credential_part).ok()?;
        let decoded_str = String::from_utf8(decoded_bytes).ok()?;
        let (user, pass) = decoded_str.split_once(':')?;
        Some((user.to_string(), pass.to_string()))
    }

    /// Validates a decoded `(username, password)` pair, either against this
    /// plugin's own static credentials or, when none are configured, against
    /// the consumer identified by `username`. Records the consumer on `ctx`
    /// when that path succeeds.
    fn authorize(&self, user: &str, pass: &str, ctx: &mut ProxyContext) -> bool {
        match (&self.config.username, &self.config.password) {
            (Some(cfg_user), Some(cfg_pass)) => {
                constant_time_eq(user, cfg_user) && constant_time_eq(pass, cfg_pass)
            }
            _ => {
                let Some((expected_pass, found)) = consumer::consumer_fetch_by_basic_auth(user)
                else {
                    return false;
                };
                if !constant_time_eq(pass, &expected_pass) {
                    return false;
                }
                ctx.consumer_username = Some(found.inner.username.clone());
                ctx.consumer_plugins = Some(found.plugins.clone());
                true
            }
        }
    }
}

#[async_trait]
impl ProxyPlugin for PluginBasicAuth {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn priority(&self) -> i32 {
        PRIORITY
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut ProxyContext) -> Result<bool> {
        let auth_header =
            request::get_req_header_value(session.req_header(), header::AUTHORIZATION.as_str());

        let is_valid = match auth_header.and_then(Self::decode_credentials) {
            Some((user, pass)) => self.authorize(&user, &pass, ctx),
            None => false,
        };

        if !is_valid {
            // Return 401 and include the standard Basic challenge header
            ResponseBuilder::send_proxy_error(
                session,
                StatusCode::UNAUTHORIZED,
                Some("Invalid user authorization"),
                Some(&[("WWW-Authenticate", "Basic realm=\"edgegate\"")]),
            )
            .await?;
            return Ok(true);
        }

        // Hide credentials by removing the Authorization header before forwarding upstream
        if self.config.hide_credentials {
            session
                .req_header_mut()
                .remove_header(&header::AUTHORIZATION);
        }

        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_plugin(username: &str, password: &str) -> PluginBasicAuth {
        PluginBasicAuth {
            config: PluginConfig {
                username: Some(username.to_string()),
                password: Some(password.to_string()),
                hide_credentials: false,
            },
        }
    }

    #[test]
    fn validate_credentials_accepts_valid_pairs() {
        let plugin = build_plugin("demo", "s3cret");
        let header = format!("Basic {}", general_purpose::STANDARD.encode("demo:s3cret"));
        let (user, pass) = PluginBasicAuth::decode_credentials(&header).unwrap();
        let mut ctx = ProxyContext::new();
        assert!(plugin.authorize(&user, &pass, &mut ctx));
    }

    #[test]
    fn validate_credentials_rejects_invalid_pairs() {
        let plugin = build_plugin("demo", "s3cret");

        // Wrong prefix
        assert!(PluginBasicAuth::decode_credentials("Bearer something").is_none());

        // Wrong password
        let header = format!("Basic {}", general_purpose::STANDARD.encode("demo:badpass"));
        let (user, pass) = PluginBasicAuth::decode_credentials(&header).unwrap();
        let mut ctx = ProxyContext::new();
        assert!(!plugin.authorize(&user, &pass, &mut ctx));
    }
}
