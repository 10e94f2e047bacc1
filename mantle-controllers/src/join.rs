//! SideroLink connection-params composition: kernel-arg surgery, extended
//! join tokens and the machine join-config bundle.
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use mantle_core::specs::join::{ConnectionParamsSpec, GrpcTunnelMode, MachineJoinConfigSpec};
use mantle_core::{DynamicResource, Phase, Spec, TypedResource};
use mantle_runtime::{Controller, ControllerError, Input, InputKind, Output, Sharing};
use mantle_store::Store;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use url::Url;

/// Kernel argument carrying the tunnel URL.
pub const SIDEROLINK_ARG_PREFIX: &str = "siderolink.api=";
/// Fixed link-local address the tunnel exposes for event and log sinks.
pub const SIDEROLINK_LINK_LOCAL_ADDR: &str = "fdae:41e4:649b:9303::1";

const TOKEN_PREFIX: &str = "v1:";

type HmacSha256 = Hmac<Sha256>;

/// Claims embedded into an extended join token.
#[derive(Clone, Debug, Default)]
pub struct ExtendedClaims {
    pub infra_provider_id: String,
    pub machine_request_id: Option<String>,
}

impl ExtendedClaims {
    fn extra_data(&self) -> BTreeMap<String, String> {
        let mut data = BTreeMap::new();
        data.insert("infra-provider-id".to_string(), self.infra_provider_id.clone());
        if let Some(request) = &self.machine_request_id {
            data.insert("machine-request-id".to_string(), request.clone());
        }
        data
    }
}

/// Extends a join token with signed claims.
///
/// Wire form: `v1:` + base64 of `{"extra_data": …, "signature": …}` where
/// the signature is HMAC-SHA-256 over the canonical (key-sorted) JSON of
/// `extra_data`, keyed by a digest of the base token.
pub fn extend_join_token(
    token: &str,
    claims: &ExtendedClaims,
) -> Result<String, ControllerError> {
    let extra_data = claims.extra_data();
    let canonical = serde_json::to_string(&extra_data)
        .map_err(|err| ControllerError::Invalid(format!("claims are not serializable: {err}")))?;
    let key = Sha256::digest(token.as_bytes());
    let mut mac = HmacSha256::new_from_slice(&key)
        .map_err(|err| ControllerError::Invalid(format!("bad token key: {err}")))?;
    mac.update(canonical.as_bytes());
    let signature = BASE64.encode(mac.finalize().into_bytes());

    let envelope = serde_json::json!({
        "extra_data": extra_data,
        "signature": signature,
    });
    let payload = serde_json::to_string(&envelope)
        .map_err(|err| ControllerError::Invalid(format!("token envelope failed: {err}")))?;
    Ok(format!("{TOKEN_PREFIX}{}", BASE64.encode(payload)))
}

/// Parses an extended token back into its claims, verifying the signature
/// against the base token.
pub fn parse_extended_token(
    token: &str,
    base_token: &str,
) -> Result<BTreeMap<String, String>, ControllerError> {
    let encoded = token
        .strip_prefix(TOKEN_PREFIX)
        .ok_or_else(|| ControllerError::Invalid("token has no version prefix".into()))?;
    let payload = BASE64
        .decode(encoded)
        .map_err(|err| ControllerError::Invalid(format!("token is not valid base64: {err}")))?;
    let envelope: serde_json::Value = serde_json::from_slice(&payload)
        .map_err(|err| ControllerError::Invalid(format!("token payload is not JSON: {err}")))?;
    let extra_data: BTreeMap<String, String> =
        serde_json::from_value(envelope.get("extra_data").cloned().unwrap_or_default())
            .map_err(|err| ControllerError::Invalid(format!("bad extra_data: {err}")))?;
    let signature = envelope
        .get("signature")
        .and_then(|s| s.as_str())
        .ok_or_else(|| ControllerError::Invalid("token has no signature".into()))?;

    let canonical = serde_json::to_string(&extra_data)
        .map_err(|err| ControllerError::Invalid(format!("claims are not serializable: {err}")))?;
    let key = Sha256::digest(base_token.as_bytes());
    let mut mac = HmacSha256::new_from_slice(&key)
        .map_err(|err| ControllerError::Invalid(format!("bad token key: {err}")))?;
    mac.update(canonical.as_bytes());
    let raw = BASE64
        .decode(signature)
        .map_err(|err| ControllerError::Invalid(format!("bad signature encoding: {err}")))?;
    mac.verify_slice(&raw)
        .map_err(|_| ControllerError::Invalid("token signature mismatch".into()))?;
    Ok(extra_data)
}

/// Rewrites the SideroLink kernel argument in `args`.
///
/// Only `jointoken` (when `token` is given) and `grpc_tunnel` (per `mode`)
/// change; every other query parameter and kernel argument is preserved, and
/// the query is re-encoded canonically (alphabetical by key).
pub fn rewrite_kernel_args(
    args: &str,
    token: Option<&str>,
    mode: GrpcTunnelMode,
) -> Result<String, ControllerError> {
    let mut rewritten = Vec::new();
    let mut matched = 0usize;
    for arg in args.split_whitespace() {
        let Some(raw_url) = arg.strip_prefix(SIDEROLINK_ARG_PREFIX) else {
            rewritten.push(arg.to_string());
            continue;
        };
        matched += 1;
        if matched > 1 {
            return Err(ControllerError::Invalid(
                "multiple SideroLink kernel arguments".into(),
            ));
        }
        let mut url = Url::parse(raw_url).map_err(|err| {
            ControllerError::Invalid(format!("malformed SideroLink URL {raw_url:?}: {err}"))
        })?;
        let mut pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        if let Some(token) = token {
            match pairs.iter_mut().find(|(k, _)| k == "jointoken") {
                Some((_, value)) => *value = token.to_string(),
                None => pairs.push(("jointoken".to_string(), token.to_string())),
            }
        }
        match mode {
            GrpcTunnelMode::Unset => {}
            GrpcTunnelMode::Enabled | GrpcTunnelMode::Disabled => {
                let flag = (mode == GrpcTunnelMode::Enabled).to_string();
                match pairs.iter_mut().find(|(k, _)| k == "grpc_tunnel") {
                    Some((_, value)) => *value = flag,
                    None => pairs.push(("grpc_tunnel".to_string(), flag)),
                }
            }
        }
        pairs.sort();
        let mut serializer = form_urlencoded::Serializer::new(String::new());
        for (key, value) in &pairs {
            serializer.append_pair(key, value);
        }
        let query = serializer.finish();
        url.set_query(if query.is_empty() { None } else { Some(&query) });
        rewritten.push(format!("{SIDEROLINK_ARG_PREFIX}{url}"));
    }
    if matched == 0 {
        return Err(ControllerError::Invalid(
            "kernel args carry no SideroLink argument".into(),
        ));
    }
    Ok(rewritten.join(" "))
}

/// The multi-document join config bundle: tunnel, event sink, kmsg log.
#[must_use]
pub fn join_config_bundle(api_url: &str, events_port: u16, logs_port: u16) -> String {
    format!(
        "apiVersion: v1alpha1\n\
         kind: SideroLinkConfig\n\
         apiUrl: {api_url}\n\
         ---\n\
         apiVersion: v1alpha1\n\
         kind: EventSinkConfig\n\
         endpoint: '[{SIDEROLINK_LINK_LOCAL_ADDR}]:{events_port}'\n\
         ---\n\
         apiVersion: v1alpha1\n\
         kind: KmsgLogConfig\n\
         name: omni-kmsg\n\
         url: 'tcp://[{SIDEROLINK_LINK_LOCAL_ADDR}]:{logs_port}'\n"
    )
}

/// A rendered join composition.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct JoinComposition {
    pub kernel_args: String,
    pub config: String,
}

/// Composes kernel args and the config bundle from connection parameters,
/// optionally extending the join token with provider claims.
pub fn compose_join_config(
    params: &ConnectionParamsSpec,
    claims: Option<&ExtendedClaims>,
    mode: GrpcTunnelMode,
) -> Result<JoinComposition, ControllerError> {
    let token = claims
        .map(|claims| extend_join_token(&params.join_token, claims))
        .transpose()?;
    let kernel_args = rewrite_kernel_args(&params.args, token.as_deref(), mode)?;
    let api_url = kernel_args
        .split_whitespace()
        .find_map(|arg| arg.strip_prefix(SIDEROLINK_ARG_PREFIX))
        .unwrap_or(&params.api_endpoint)
        .to_string();
    Ok(JoinComposition {
        config: join_config_bundle(&api_url, params.events_port, params.logs_port),
        kernel_args,
    })
}

/// Renders the default machine join artifacts from connection parameters.
pub struct MachineJoinConfigController;

#[async_trait::async_trait]
impl Controller for MachineJoinConfigController {
    fn name(&self) -> &'static str {
        "MachineJoinConfigController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::kind(ConnectionParamsSpec::KIND, InputKind::Weak)]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output {
            kind: MachineJoinConfigSpec::KIND,
            sharing: Sharing::Exclusive,
        }]
    }

    async fn transform(
        &self,
        store: &Store,
        output_id: &str,
    ) -> Result<Option<DynamicResource>, ControllerError> {
        let params = match store.get_as::<ConnectionParamsSpec>(output_id).await {
            Ok(params) => params,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if params.metadata.phase == Phase::TearingDown {
            return Ok(None);
        }
        let mode = if params.spec.use_grpc_tunnel {
            GrpcTunnelMode::Enabled
        } else {
            GrpcTunnelMode::Disabled
        };
        let composed = compose_join_config(&params.spec, None, mode)?;
        let output = TypedResource::new(output_id, MachineJoinConfigSpec {
            kernel_args: composed.kernel_args,
            config: composed.config,
        });
        Ok(Some(output.into_dynamic()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ConnectionParamsSpec {
        ConnectionParamsSpec {
            api_endpoint: "https://127.0.0.1:8099".into(),
            join_token: "abcd".into(),
            args: "siderolink.api=https://127.0.0.1:8099?jointoken=abcd a=b".into(),
            use_grpc_tunnel: true,
            events_port: 8090,
            logs_port: 8092,
        }
    }

    #[test]
    fn provider_composition_extends_the_token_and_alphabetizes_the_query() {
        let claims = ExtendedClaims {
            infra_provider_id: "test".into(),
            machine_request_id: None,
        };
        let composed =
            compose_join_config(&params(), Some(&claims), GrpcTunnelMode::Enabled).unwrap();

        let args: Vec<&str> = composed.kernel_args.split_whitespace().collect();
        let siderolink: Vec<&&str> = args
            .iter()
            .filter(|a| a.starts_with(SIDEROLINK_ARG_PREFIX))
            .collect();
        assert_eq!(siderolink.len(), 1, "exactly one SideroLink token");
        assert!(args.contains(&"a=b"), "unrelated args preserved verbatim");

        let url = Url::parse(siderolink[0].strip_prefix(SIDEROLINK_ARG_PREFIX).unwrap()).unwrap();
        let query_keys: Vec<String> = url.query_pairs().map(|(k, _)| k.into_owned()).collect();
        assert_eq!(query_keys, vec!["grpc_tunnel", "jointoken"]);
        let pairs: std::collections::HashMap<String, String> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(pairs["grpc_tunnel"], "true");
        assert!(pairs["jointoken"].starts_with("v1:"));

        // The extended token verifies against the base token and carries the
        // provider claim.
        let claims = parse_extended_token(&pairs["jointoken"], "abcd").unwrap();
        assert_eq!(claims["infra-provider-id"], "test");
        assert!(!claims.contains_key("machine-request-id"));
    }

    #[test]
    fn tampered_extended_tokens_are_rejected() {
        let claims = ExtendedClaims {
            infra_provider_id: "test".into(),
            machine_request_id: Some("req-1".into()),
        };
        let token = extend_join_token("abcd", &claims).unwrap();
        assert!(parse_extended_token(&token, "abcd").is_ok());
        // Wrong base token means wrong key.
        assert!(parse_extended_token(&token, "efgh").is_err());
        assert!(parse_extended_token("no-prefix", "abcd").is_err());
    }

    #[test]
    fn unset_tunnel_mode_keeps_the_existing_flag() {
        let args = "siderolink.api=https://host?grpc_tunnel=true&jointoken=abcd";
        let rewritten =
            rewrite_kernel_args(args, Some("newtoken"), GrpcTunnelMode::Unset).unwrap();
        assert!(rewritten.contains("grpc_tunnel=true"));
        assert!(rewritten.contains("jointoken=newtoken"));

        let rewritten =
            rewrite_kernel_args(args, None, GrpcTunnelMode::Disabled).unwrap();
        assert!(rewritten.contains("grpc_tunnel=false"));
        assert!(rewritten.contains("jointoken=abcd"));
    }

    #[test]
    fn missing_or_duplicate_siderolink_args_are_invalid() {
        assert!(rewrite_kernel_args("a=b c=d", None, GrpcTunnelMode::Unset).is_err());
        assert!(rewrite_kernel_args(
            "siderolink.api=https://h1?jointoken=t siderolink.api=https://h2?jointoken=t",
            None,
            GrpcTunnelMode::Unset,
        )
        .is_err());
        assert!(rewrite_kernel_args(
            "siderolink.api=::not-a-url::",
            None,
            GrpcTunnelMode::Unset,
        )
        .is_err());
    }

    #[test]
    fn bundle_documents_are_ordered_and_addressed() {
        let bundle = join_config_bundle("https://host?jointoken=t", 8090, 8092);
        let docs: Vec<&str> = bundle.split("---\n").collect();
        assert_eq!(docs.len(), 3);
        assert!(docs[0].contains("kind: SideroLinkConfig"));
        assert!(docs[1].contains("kind: EventSinkConfig"));
        assert!(docs[1].contains("[fdae:41e4:649b:9303::1]:8090"));
        assert!(docs[2].contains("kind: KmsgLogConfig"));
        assert!(docs[2].contains("tcp://[fdae:41e4:649b:9303::1]:8092"));
    }
}
