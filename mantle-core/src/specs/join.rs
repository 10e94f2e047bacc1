//! Tunnel-join plane: connection parameters and join tokens.
use crate::resource::Spec;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tri-state switch for the gRPC tunnel kernel argument.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum GrpcTunnelMode {
    /// Keep whatever the existing kernel args say.
    #[default]
    Unset,
    Enabled,
    Disabled,
}

/// How machines reach the manager: API endpoint, join token and the kernel
/// args handed to booting machines.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionParamsSpec {
    #[serde(default)]
    pub api_endpoint: String,
    #[serde(default)]
    pub join_token: String,
    /// Space-separated `key=value` kernel args, exactly one of which carries
    /// the tunnel URL.
    #[serde(default)]
    pub args: String,
    #[serde(default)]
    pub use_grpc_tunnel: bool,
    #[serde(default)]
    pub events_port: u16,
    #[serde(default)]
    pub logs_port: u16,
}

impl Spec for ConnectionParamsSpec {
    const KIND: &'static str = "ConnectionParams";
}

/// The advertised API surface of the manager.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct APIConfigSpec {
    #[serde(default)]
    pub advertised_url: String,
}

impl Spec for APIConfigSpec {
    const KIND: &'static str = "APIConfig";
}

/// Points at the join token handed out by default.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DefaultJoinTokenSpec {
    #[serde(default)]
    pub token_id: String,
}

impl Spec for DefaultJoinTokenSpec {
    const KIND: &'static str = "DefaultJoinToken";
}

/// A bearer token authorizing machines to register.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JoinTokenSpec {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<DateTime<Utc>>,
    #[serde(default)]
    pub revoked: bool,
}

impl Spec for JoinTokenSpec {
    const KIND: &'static str = "JoinToken";
}

/// Links a registered machine to the token it joined with.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JoinTokenUsageSpec {
    #[serde(default)]
    pub token_id: String,
}

impl Spec for JoinTokenUsageSpec {
    const KIND: &'static str = "JoinTokenUsage";
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum JoinTokenState {
    #[default]
    Active,
    Revoked,
    Expired,
}

/// Rollup of a join token's state and use count.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JoinTokenStatusSpec {
    #[serde(default)]
    pub state: JoinTokenState,
    #[serde(default)]
    pub use_count: u64,
}

impl Spec for JoinTokenStatusSpec {
    const KIND: &'static str = "JoinTokenStatus";
}

/// Rendered join artifacts for plain machines.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineJoinConfigSpec {
    #[serde(default)]
    pub kernel_args: String,
    /// Multi-document machine-config bundle (tunnel, event sink, kmsg log).
    #[serde(default)]
    pub config: String,
}

impl Spec for MachineJoinConfigSpec {
    const KIND: &'static str = "MachineJoinConfig";
}

/// Rendered join artifacts for an infrastructure provider, carrying
/// provider-scoped extended tokens.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderJoinConfigSpec {
    #[serde(default)]
    pub provider_id: String,
    #[serde(default)]
    pub kernel_args: String,
    #[serde(default)]
    pub config: String,
}

impl Spec for ProviderJoinConfigSpec {
    const KIND: &'static str = "ProviderJoinConfig";
}
