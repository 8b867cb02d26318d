//! Typed control commands.
//!
//! Parameter names depend on the schema generation the server speaks:
//! legacy servers address clients as `{"client": id}`, grouped servers as
//! `{"id": id}` and take the volume as an object. Successful commands are
//! reflected in the mirror right away, since servers only notify *other*
//! control clients about the change.

use crate::error::{ControlError, Result};
use crate::session::Session;
use crate::types::{ClientId, ProtocolVersion, RpcVersion, ServerStatus, Volume};
use serde::Deserialize;
use serde_json::{json, Value};

pub const GET_STATUS: &str = "Server.GetStatus";
pub const GET_RPC_VERSION: &str = "Server.GetRPCVersion";
pub const DELETE_CLIENT: &str = "Server.DeleteClient";
pub const CLIENT_SET_VOLUME: &str = "Client.SetVolume";
pub const CLIENT_SET_MUTE: &str = "Client.SetMute";
pub const CLIENT_SET_NAME: &str = "Client.SetName";
pub const CLIENT_SET_LATENCY: &str = "Client.SetLatency";
pub const CLIENT_SET_STREAM: &str = "Client.SetStream";
pub const GROUP_SET_STREAM: &str = "Group.SetStream";
pub const GROUP_SET_MUTE: &str = "Group.SetMute";
pub const GROUP_SET_NAME: &str = "Group.SetName";
pub const GROUP_SET_CLIENTS: &str = "Group.SetClients";

impl Session {
    // ========== Server ==========

    /// Fetch the complete server state
    ///
    /// The mirror is replaced before this returns.
    pub async fn get_status(&self) -> Result<ServerStatus> {
        let result = self.call(GET_STATUS, None).await?;
        ServerStatus::from_result(result)
            .map_err(|e| ControlError::InvalidResponse(format!("{}: {}", GET_STATUS, e)))
    }

    /// Ask the server which control protocol version it implements
    pub async fn get_rpc_version(&self) -> Result<RpcVersion> {
        let result = self.call(GET_RPC_VERSION, None).await?;
        RpcVersion::deserialize(&result)
            .map_err(|e| ControlError::InvalidResponse(format!("{}: {}", GET_RPC_VERSION, e)))
    }

    /// Remove a client from the server's configuration
    ///
    /// The client stays in the mirror flagged as deleted; see
    /// [`Session::purge_client`].
    pub async fn delete_client(&self, client_id: &str) -> Result<()> {
        let params = self.client_params(client_id);
        self.call(DELETE_CLIENT, Some(params)).await?;
        if self.protocol() == ProtocolVersion::Legacy {
            self.mark_client_deleted(client_id);
        }
        Ok(())
    }

    // ========== Client Control ==========

    /// Set a client's volume in percent (clamped to 100)
    pub async fn set_volume(&self, client_id: &str, percent: u8) -> Result<()> {
        let percent = percent.min(100);
        let mut params = self.client_params(client_id);
        match self.protocol() {
            ProtocolVersion::Legacy => params["volume"] = json!(percent),
            ProtocolVersion::Grouped => {
                let current = self.client_volume(client_id)?;
                params["volume"] = json!(Volume::new(percent, current.muted));
            }
        }

        self.call(CLIENT_SET_VOLUME, Some(params)).await?;
        self.update_client(client_id, |c| c.config.volume.percent = percent);
        Ok(())
    }

    /// Mute or unmute a client
    pub async fn set_mute(&self, client_id: &str, muted: bool) -> Result<()> {
        let mut params = self.client_params(client_id);
        let method = match self.protocol() {
            ProtocolVersion::Legacy => {
                params["mute"] = json!(muted);
                CLIENT_SET_MUTE
            }
            ProtocolVersion::Grouped => {
                // mute is part of the volume object here
                let current = self.client_volume(client_id)?;
                params["volume"] = json!(Volume::new(current.percent, muted));
                CLIENT_SET_VOLUME
            }
        };

        self.call(method, Some(params)).await?;
        self.update_client(client_id, |c| c.config.volume.muted = muted);
        Ok(())
    }

    /// Set the display name of a client
    pub async fn set_client_name(&self, client_id: &str, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        let mut params = self.client_params(client_id);
        params["name"] = json!(name);

        self.call(CLIENT_SET_NAME, Some(params)).await?;
        self.update_client(client_id, |c| c.config.name = name);
        Ok(())
    }

    /// Set a client's additional latency in milliseconds
    pub async fn set_latency(&self, client_id: &str, latency: i32) -> Result<()> {
        let mut params = self.client_params(client_id);
        params["latency"] = json!(latency);

        self.call(CLIENT_SET_LATENCY, Some(params)).await?;
        self.update_client(client_id, |c| c.config.latency = latency);
        Ok(())
    }

    /// Switch the stream a client plays
    ///
    /// On grouped servers streams belong to groups, so this switches the
    /// client's whole group.
    pub async fn set_client_stream(&self, client_id: &str, stream_id: &str) -> Result<()> {
        match self.protocol() {
            ProtocolVersion::Legacy => {
                let mut params = self.client_params(client_id);
                params["id"] = json!(stream_id);

                self.call(CLIENT_SET_STREAM, Some(params)).await?;
                self.update_client(client_id, |c| c.stream_id = Some(stream_id.to_string()));
                Ok(())
            }
            ProtocolVersion::Grouped => {
                let group_id = self
                    .with_status(|status| status.group_of_client(client_id).map(|g| g.id.clone()))
                    .ok_or_else(|| ControlError::NotFound {
                        kind: "client",
                        id: client_id.to_string(),
                    })?;
                self.set_group_stream(&group_id, stream_id).await
            }
        }
    }

    // ========== Group Control ==========

    /// Switch the stream a group plays
    pub async fn set_group_stream(&self, group_id: &str, stream_id: &str) -> Result<()> {
        let params = json!({ "id": group_id, "stream_id": stream_id });
        self.call(GROUP_SET_STREAM, Some(params)).await?;
        self.update_group(group_id, |g| g.stream_id = stream_id.to_string());
        Ok(())
    }

    /// Mute or unmute a whole group
    pub async fn set_group_mute(&self, group_id: &str, muted: bool) -> Result<()> {
        let params = json!({ "id": group_id, "mute": muted });
        self.call(GROUP_SET_MUTE, Some(params)).await?;
        self.update_group(group_id, |g| g.muted = muted);
        Ok(())
    }

    /// Set the display name of a group
    pub async fn set_group_name(&self, group_id: &str, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        let params = json!({ "id": group_id, "name": name });
        self.call(GROUP_SET_NAME, Some(params)).await?;
        self.update_group(group_id, |g| g.name = name);
        Ok(())
    }

    /// Make `clients` the members of a group
    ///
    /// The server answers with the complete new state, which replaces the
    /// mirror.
    pub async fn set_group_clients(&self, group_id: &str, clients: &[ClientId]) -> Result<()> {
        let params = json!({ "id": group_id, "clients": clients });
        self.call(GROUP_SET_CLIENTS, Some(params)).await?;
        Ok(())
    }

    // ========== Helpers ==========

    fn client_params(&self, client_id: &str) -> Value {
        match self.protocol() {
            ProtocolVersion::Legacy => json!({ "client": client_id }),
            ProtocolVersion::Grouped => json!({ "id": client_id }),
        }
    }

    fn client_volume(&self, client_id: &str) -> Result<Volume> {
        self.with_status(|status| status.client(client_id).map(|c| c.volume()))
            .ok_or_else(|| ControlError::NotFound {
                kind: "client",
                id: client_id.to_string(),
            })
    }
}
