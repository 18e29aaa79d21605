//! Typed wrappers for the agent's request/reply commands.

use std::collections::BTreeMap;

use rmpv::Value;

use crate::rpc::client::{RpcClient, RpcClientError};
use crate::rpc::proto::{
    Command, EventRequest, ForceLeaveRequest, JoinRequest, JoinResponse, KeyRequest, KeyResponse,
    Member, MembersFilter, MembersResponse, TagsRequest,
};

impl RpcClient {
    /// Fires a custom user event across the cluster.
    pub async fn event(
        &self,
        name: &str,
        payload: Option<&[u8]>,
        coalesce: bool,
    ) -> Result<(), RpcClientError> {
        let body = EventRequest {
            name: name.to_string(),
            payload: payload.map(<[u8]>::to_vec).unwrap_or_default(),
            coalesce,
        };
        self.request(Command::Event, Some(&body)).await?;
        Ok(())
    }

    /// Forces a failed node into the `left` state.
    pub async fn force_leave(&self, node: &str) -> Result<(), RpcClientError> {
        let body = ForceLeaveRequest {
            node: node.to_string(),
        };
        self.request(Command::ForceLeave, Some(&body)).await?;
        Ok(())
    }

    /// Joins the agent to existing members. `replay` asks for old user events.
    pub async fn join<I, S>(&self, existing: I, replay: bool) -> Result<JoinResponse, RpcClientError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let body = JoinRequest {
            existing: existing.into_iter().map(Into::into).collect(),
            replay,
        };
        self.request(Command::Join, Some(&body)).await?.body_as()
    }

    /// Every member the agent knows about.
    pub async fn members(&self) -> Result<Vec<Member>, RpcClientError> {
        let response = self.request::<()>(Command::Members, None).await?;
        Ok(response.body_as::<MembersResponse>()?.members)
    }

    /// Members matching `filter`'s tags, status and optional name.
    pub async fn members_filtered(
        &self,
        filter: &MembersFilter,
    ) -> Result<Vec<Member>, RpcClientError> {
        let response = self.request(Command::MembersFiltered, Some(filter)).await?;
        Ok(response.body_as::<MembersResponse>()?.members)
    }

    /// Sets `add` and removes `delete` from the agent's own tags.
    pub async fn tags<I, S>(
        &self,
        add: BTreeMap<String, String>,
        delete: I,
    ) -> Result<(), RpcClientError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let body = TagsRequest {
            tags: add,
            delete_tags: delete.into_iter().map(Into::into).collect(),
        };
        self.request(Command::Tags, Some(&body)).await?;
        Ok(())
    }

    /// Gracefully leaves the cluster. The agent shuts down afterwards.
    pub async fn leave(&self) -> Result<(), RpcClientError> {
        self.request::<()>(Command::Leave, None).await?;
        Ok(())
    }

    /// Installs `key` in every member's keyring.
    pub async fn install_key(&self, key: &str) -> Result<KeyResponse, RpcClientError> {
        self.key_command(Command::InstallKey, key).await
    }

    /// Makes the installed `key` the primary encryption key.
    pub async fn use_key(&self, key: &str) -> Result<KeyResponse, RpcClientError> {
        self.key_command(Command::UseKey, key).await
    }

    /// Removes `key` from every member's keyring.
    pub async fn remove_key(&self, key: &str) -> Result<KeyResponse, RpcClientError> {
        self.key_command(Command::RemoveKey, key).await
    }

    /// Lists the installed keys with the number of members holding each.
    pub async fn list_keys(&self) -> Result<KeyResponse, RpcClientError> {
        self.request::<()>(Command::ListKeys, None).await?.body_as()
    }

    /// Agent runtime statistics, as the nested map the agent reports.
    pub async fn stats(&self) -> Result<Value, RpcClientError> {
        let response = self.request::<()>(Command::Stats, None).await?;
        response
            .body
            .ok_or_else(|| RpcClientError::Decode("stats reply has no body".to_string()))
    }

    async fn key_command(&self, command: Command, key: &str) -> Result<KeyResponse, RpcClientError> {
        let body = KeyRequest {
            key: key.to_string(),
        };
        self.request(command, Some(&body)).await?.body_as()
    }
}
