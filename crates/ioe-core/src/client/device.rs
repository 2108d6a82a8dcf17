//! Typed device RPCs on top of [`Connection::call`].

use crate::api::{
    AppDownloadRequest, AppInstRequest, AppNewRequest, AppStopRequest, Application,
    EditorOperation, EditorRequest, EventRecord, FileNode, FileStat, NodeChildren,
    parse_app_list, parse_event_list,
};
use crate::client::connection::Connection;
use crate::error::{ClientError, Result};
use crate::wire::{
    self, CODE_APP_DOWNLOAD, CODE_APP_LIST, CODE_APP_NEW, CODE_APP_START, CODE_APP_STOP,
    CODE_DEVICE_INFO, CODE_EDITOR_GET, CODE_EDITOR_POST, CODE_EVENT_LIST,
};

use futures::future::{BoxFuture, try_join_all};
use serde_json::Value;

/// Editor id of an application's root folder.
pub const ROOT_NODE_ID: &str = "#";

/// Map an application path to the editor node id: the empty path and `/`
/// both name the root.
pub fn node_id(path: &str) -> &str {
    if path.is_empty() || path == "/" {
        ROOT_NODE_ID
    } else {
        path
    }
}

/// Split `/a/b/c.lua` into (`/a/b`, `c.lua`). A top-level entry has the
/// root as parent.
pub fn split_path(path: &str) -> (&str, &str) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((parent, base)) => (node_id(parent), base),
        None => (ROOT_NODE_ID, trimmed),
    }
}

impl Connection {
    async fn editor(&self, code: &str, request: EditorRequest<'_>) -> Result<Option<Value>> {
        self.call(code, wire::request_body(&request)).await
    }

    /// File mutations are refused locally unless the device runs in beta
    /// mode.
    fn require_beta(&self) -> Result<()> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        if !self.is_beta() {
            return Err(ClientError::NotBeta);
        }
        Ok(())
    }

    // ── Applications ───────────────────────────────────────────────────

    pub async fn list_apps(&self) -> Result<Vec<Application>> {
        let body = self.call(CODE_APP_LIST, Value::Object(Default::default())).await?;
        parse_app_list(body)
    }

    /// Create instance `inst` of application `name`. The new instance has
    /// no released version yet and is local to the device.
    pub async fn create_app(&self, name: &str, inst: &str) -> Result<Application> {
        log::info!("Creating application {} as {}", name, inst);
        self.call(
            CODE_APP_NEW,
            wire::request_body(&AppNewRequest { app: name, inst }),
        )
        .await?;
        Ok(Application {
            inst: inst.to_string(),
            name: name.to_string(),
            version: 0,
            islocal: Some(1),
            sn: self.device_sn().unwrap_or_default(),
            ..Application::default()
        })
    }

    pub async fn start_app(&self, inst: &str) -> Result<()> {
        self.call(CODE_APP_START, wire::request_body(&AppInstRequest { inst }))
            .await?;
        Ok(())
    }

    pub async fn stop_app(&self, inst: &str, reason: &str) -> Result<()> {
        self.call(
            CODE_APP_STOP,
            wire::request_body(&AppStopRequest { inst, reason }),
        )
        .await?;
        Ok(())
    }

    /// Stop, wait `restart_delay`, start. Start is never attempted when stop
    /// fails.
    pub async fn restart_app(&self, inst: &str, reason: &str) -> Result<()> {
        self.stop_app(inst, reason).await?;
        tokio::time::sleep(self.options().restart_delay).await;
        self.start_app(inst).await
    }

    /// Ask the device to fetch a released version of `inst` from the cloud.
    pub async fn app_download(&self, inst: &str, version: Option<&str>) -> Result<Option<Value>> {
        self.call(
            CODE_APP_DOWNLOAD,
            wire::request_body(&AppDownloadRequest { inst, version }),
        )
        .await
    }

    pub async fn device_info(&self) -> Result<Value> {
        let body = self
            .call(CODE_DEVICE_INFO, Value::Object(Default::default()))
            .await?;
        Ok(body.unwrap_or(Value::Null))
    }

    /// Event history as the device keeps it, independent of the local buffer.
    pub async fn event_list(&self) -> Result<Vec<EventRecord>> {
        let body = self
            .call(CODE_EVENT_LIST, Value::Object(Default::default()))
            .await?;
        parse_event_list(body)
    }

    // ── Application files ──────────────────────────────────────────────

    /// List the nodes under `path`. With `recursive`, every folder below is
    /// listed too, one request per folder, all in flight at once.
    pub fn dir_app<'a>(
        &'a self,
        inst: &'a str,
        path: &'a str,
        recursive: bool,
    ) -> BoxFuture<'a, Result<Vec<FileNode>>> {
        Box::pin(async move {
            let body = self
                .editor(
                    CODE_EDITOR_GET,
                    EditorRequest::new(inst, EditorOperation::GetNode, node_id(path)),
                )
                .await?;
            let mut nodes: Vec<FileNode> = match body {
                Some(Value::Null) | None => Vec::new(),
                Some(value) => serde_json::from_value(value)?,
            };
            if recursive {
                try_join_all(nodes.iter_mut().map(|node| self.expand_node(inst, node))).await?;
            }
            Ok(nodes)
        })
    }

    fn expand_node<'a>(
        &'a self,
        inst: &'a str,
        node: &'a mut FileNode,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if node.is_folder() && matches!(node.children, NodeChildren::Expandable(true)) {
                let children = self.dir_app(inst, &node.id, true).await?;
                node.children = NodeChildren::Loaded(children);
            } else if let NodeChildren::Loaded(children) = &mut node.children {
                try_join_all(children.iter_mut().map(|child| self.expand_node(inst, child)))
                    .await?;
            }
            Ok(())
        })
    }

    /// Content of a file. An empty file is returned as an empty string; a
    /// reply without `content` is an error.
    pub async fn download_file(&self, inst: &str, path: &str) -> Result<String> {
        let body = self
            .editor(
                CODE_EDITOR_GET,
                EditorRequest::new(inst, EditorOperation::GetContent, path),
            )
            .await?;
        body.as_ref()
            .and_then(|b| b.get("content"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ClientError::Domain("No file content found".to_string()))
    }

    pub async fn upload_file(&self, inst: &str, path: &str, content: &str) -> Result<()> {
        self.require_beta()?;
        log::info!("Uploading {} of {} ({} bytes)", path, inst, content.len());
        self.editor(
            CODE_EDITOR_POST,
            EditorRequest::new(inst, EditorOperation::SetContentEx, path).text(content),
        )
        .await?;
        Ok(())
    }

    /// Rename within the same folder. `new_path` may be a full path or a
    /// bare name.
    pub async fn rename(&self, inst: &str, old_path: &str, new_path: &str) -> Result<()> {
        self.require_beta()?;
        let new_name = if new_path.contains('/') {
            let (old_parent, _) = split_path(old_path);
            let (new_parent, new_name) = split_path(new_path);
            if old_parent != new_parent {
                return Err(ClientError::Domain(format!(
                    "Cannot move {} to another folder",
                    old_path
                )));
            }
            new_name
        } else {
            new_path
        };
        self.editor(
            CODE_EDITOR_GET,
            EditorRequest::new(inst, EditorOperation::RenameNode, old_path).text(new_name),
        )
        .await?;
        Ok(())
    }

    pub async fn delete(&self, inst: &str, path: &str) -> Result<()> {
        self.require_beta()?;
        self.editor(
            CODE_EDITOR_GET,
            EditorRequest::new(inst, EditorOperation::DeleteNode, path),
        )
        .await?;
        Ok(())
    }

    pub async fn create_directory(&self, inst: &str, path: &str) -> Result<()> {
        self.create_node(inst, path, "folder").await
    }

    pub async fn create_file(&self, inst: &str, path: &str) -> Result<()> {
        self.create_node(inst, path, "file").await
    }

    // The device creates nodes by (folder, name), not by path.
    async fn create_node(&self, inst: &str, path: &str, node_type: &str) -> Result<()> {
        self.require_beta()?;
        let (parent, name) = split_path(path);
        if name.is_empty() {
            return Err(ClientError::Domain(format!("Invalid path `{}`", path)));
        }
        self.editor(
            CODE_EDITOR_GET,
            EditorRequest::new(inst, EditorOperation::CreateNode, parent)
                .text(name)
                .node_type(node_type),
        )
        .await?;
        Ok(())
    }

    pub async fn stat(&self, inst: &str, path: &str) -> Result<FileStat> {
        let body = self
            .editor(
                CODE_EDITOR_GET,
                EditorRequest::new(inst, EditorOperation::GetFileStat, path),
            )
            .await?;
        match body {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Err(ClientError::Protocol("get_file_stat reply has no body".to_string())),
        }
    }
}
