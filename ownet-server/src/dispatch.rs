//! Executes one request against the device tree.
use std::sync::Arc;

use nix::errno::Errno;
use ownet_protocol::{ControlFlags, MessageKind, PATH_MAX, Request, Response, Version};
use tokio::{io::AsyncWrite, sync::mpsc};

use crate::{
    DeviceTree,
    context::ServerContext,
    keepalive::Outbound,
    locks::LockPlan,
    query::{DirEntry, Node, QueryContext, QueryResult},
};

/// Header fields shared by every response to one request.
#[derive(Copy, Clone, Debug)]
pub(crate) struct ResponseTemplate {
    pub version: Version,
    pub flags: ControlFlags,
}

impl ResponseTemplate {
    pub(crate) fn ok(&self) -> Response {
        Response::new(self.version, self.flags)
    }

    pub(crate) fn error(&self, errno: Errno) -> Response {
        let mut response = self.ok();
        response.ret = -(errno as i32);
        response
    }

    pub(crate) fn keepalive(&self) -> Response {
        Response::keepalive(self.version, self.flags)
    }

    fn text(&self, text: &str) -> Response {
        let mut response = self.ok();
        response.size = text.len() as i32;
        response.data = Vec::with_capacity(text.len() + 1);
        response.data.extend_from_slice(text.as_bytes());
        response.data.push(0);
        response
    }
}

pub(crate) struct Dispatcher<T: DeviceTree> {
    context: Arc<ServerContext<T>>,
}

impl<T: DeviceTree> Clone for Dispatcher<T> {
    fn clone(&self) -> Self {
        Dispatcher {
            context: Arc::clone(&self.context),
        }
    }
}

impl<T: DeviceTree> Dispatcher<T> {
    pub(crate) fn new(context: Arc<ServerContext<T>>) -> Dispatcher<T> {
        Dispatcher { context }
    }

    /// Runs a device tree call on the blocking pool.
    async fn blocking<R, F>(&self, call: F) -> QueryResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&T) -> QueryResult<R> + Send + 'static,
    {
        let tree = Arc::clone(self.context.tree());
        tokio::task::spawn_blocking(move || call(&tree))
            .await
            .unwrap_or_else(|e| {
                log::error!("Device query failed: {}", e);
                Err(Errno::EIO)
            })
    }

    async fn resolve(&self, path: &str, query: &QueryContext) -> QueryResult<Node> {
        let path = path.to_owned();
        let query = query.clone();
        self.blocking(move |tree| tree.resolve(&path, &query)).await
    }

    /// Produces the final response to `request`. Directory elements are streamed through
    /// `outbound` before it returns.
    pub(crate) async fn dispatch<W: AsyncWrite + Unpin>(
        &self,
        request: &Request,
        reply: ResponseTemplate,
        outbound: &Outbound<W>,
    ) -> Response {
        if self.context.tokens().has_visited(&request.tokens) {
            log::warn!(
                "Refusing {} {:?}: request already passed through this server",
                request.kind,
                request.path
            );
            return reply.error(Errno::ELOOP);
        }

        let query = QueryContext {
            flags: request.flags,
            tokens: self.context.tokens().outbound(&request.tokens),
        };

        let path = match (request.kind.needs_path(), request.path.as_deref()) {
            (false, _) => None,
            (true, None) => return reply.error(Errno::EBADMSG),
            (true, Some(path)) if path.len() >= PATH_MAX => {
                log::warn!("Refusing path of {} bytes", path.len());
                return reply.error(Errno::EMSGSIZE);
            }
            (true, Some(path)) => Some(path),
        };

        let result = match (request.kind, path) {
            (MessageKind::Nop, _) => Ok(reply.ok()),
            (MessageKind::Presence, Some(path)) => {
                self.resolve(path, &query).await.map(|_| reply.ok())
            }
            (MessageKind::Read, Some(path)) => self.read(path, request, &query, reply).await,
            (MessageKind::Write, Some(path)) => self.write(path, request, &query, reply).await,
            (MessageKind::Dir, Some(path)) => Ok(self.dir(path, &query, reply, outbound).await),
            (MessageKind::DirAll, Some(path)) => Ok(self.dir_all(path, &query, reply, false).await),
            (MessageKind::DirAllSlash, Some(path)) => {
                Ok(self.dir_all(path, &query, reply, true).await)
            }
            (MessageKind::Get, Some(path)) => self.get(path, request, &query, reply, false).await,
            (MessageKind::GetSlash, Some(path)) => {
                self.get(path, request, &query, reply, true).await
            }
            (kind, _) => {
                log::debug!("Unsupported request kind {}", kind);
                Err(Errno::ENOMSG)
            }
        };
        result.unwrap_or_else(|errno| reply.error(errno))
    }

    async fn read(
        &self,
        path: &str,
        request: &Request,
        query: &QueryContext,
        reply: ResponseTemplate,
    ) -> QueryResult<Response> {
        let max = self.context.config().max_payload_size;
        if request.size <= 0 || request.size as usize > max {
            return Err(Errno::EMSGSIZE);
        }
        let node = self.resolve(path, query).await?;
        self.read_node(node, request.size as usize, request.offset, query, reply)
            .await
    }

    async fn read_node(
        &self,
        node: Node,
        size: usize,
        offset: i32,
        query: &QueryContext,
        reply: ResponseTemplate,
    ) -> QueryResult<Response> {
        if node.is_dir() {
            return Err(Errno::EISDIR);
        }
        if offset < 0 {
            return Err(Errno::EINVAL);
        }
        let _held = self
            .context
            .locks()
            .acquire(LockPlan::for_node(&node))
            .await;
        let query = query.clone();
        let mut data = self
            .blocking(move |tree| tree.read(&node, &query, offset as usize, size))
            .await?;
        data.truncate(size);

        let mut response = reply.ok();
        response.ret = data.len() as i32;
        if !data.is_empty() {
            response.size = data.len() as i32;
            response.offset = offset;
            response.data = data;
        }
        Ok(response)
    }

    async fn write(
        &self,
        path: &str,
        request: &Request,
        query: &QueryContext,
        reply: ResponseTemplate,
    ) -> QueryResult<Response> {
        // Everything after the path is data, and it has to cover the declared size
        if request.data.is_empty() || request.size < 0 || request.data.len() < request.size as usize
        {
            return Err(Errno::EMSGSIZE);
        }
        if request.offset < 0 {
            return Err(Errno::EINVAL);
        }
        let node = self.resolve(path, query).await?;
        if node.is_dir() {
            return Err(Errno::EISDIR);
        }
        let _held = self
            .context
            .locks()
            .acquire(LockPlan::for_node(&node))
            .await;
        let data = request.data[..request.size as usize].to_vec();
        let offset = request.offset as usize;
        let query = query.clone();
        self.blocking(move |tree| tree.write(&node, &query, offset, &data))
            .await?;
        Ok(reply.ok())
    }

    /// Streams one response per element, then the terminator carrying the result and the
    /// directory flags.
    async fn dir<W: AsyncWrite + Unpin>(
        &self,
        path: &str,
        query: &QueryContext,
        reply: ResponseTemplate,
        outbound: &Outbound<W>,
    ) -> Response {
        let node = match self.resolve(path, query).await {
            Ok(node) if node.is_dir() => node,
            Ok(_) => return reply.error(Errno::ENOTDIR),
            Err(errno) => return reply.error(errno),
        };
        let _held = self
            .context
            .locks()
            .acquire(LockPlan::for_node(&node))
            .await;

        let (entries, mut discovered) = mpsc::unbounded_channel::<DirEntry>();
        let query = query.clone();
        let listing = self.blocking(move |tree| {
            tree.list(&node, &query, &mut |entry| {
                // Only fails once the connection is gone, the listing still completes
                let _ = entries.send(entry);
            })
        });
        tokio::pin!(listing);

        let mut connected = true;
        let mut result = None;
        loop {
            tokio::select! {
                entry = discovered.recv() => match entry {
                    Some(entry) if connected => {
                        if let Err(e) = outbound.send(reply.text(&entry.path)).await {
                            log::debug!("Directory element not delivered: {}", e);
                            connected = false;
                        }
                    }
                    Some(_) => {}
                    None => break,
                },
                flags = &mut listing, if result.is_none() => result = Some(flags),
            }
        }
        let result = match result {
            Some(result) => result,
            None => listing.await,
        };

        let mut terminator = reply.ok();
        match result {
            Ok(flags) => terminator.offset = flags as i32,
            Err(errno) => terminator.ret = -(errno as i32),
        }
        terminator
    }

    async fn list_all(
        &self,
        node: Node,
        query: &QueryContext,
    ) -> QueryResult<(Vec<DirEntry>, u32)> {
        let _held = self
            .context
            .locks()
            .acquire(LockPlan::for_node(&node))
            .await;
        let query = query.clone();
        self.blocking(move |tree| {
            let mut entries = Vec::new();
            let flags = tree.list(&node, &query, &mut |entry| entries.push(entry))?;
            Ok((entries, flags))
        })
        .await
    }

    /// One response holding every element, comma separated.
    async fn dir_all(
        &self,
        path: &str,
        query: &QueryContext,
        reply: ResponseTemplate,
        slash: bool,
    ) -> Response {
        match self.resolve(path, query).await {
            Ok(node) if node.is_dir() => self.dir_all_node(node, query, reply, slash).await,
            Ok(_) => reply.error(Errno::ENOTDIR),
            Err(errno) => reply.error(errno),
        }
    }

    async fn dir_all_node(
        &self,
        node: Node,
        query: &QueryContext,
        reply: ResponseTemplate,
        slash: bool,
    ) -> Response {
        let (entries, flags) = match self.list_all(node, query).await {
            Ok(listing) => listing,
            Err(errno) => return reply.error(errno),
        };
        let list = entries
            .iter()
            .map(|entry| {
                if slash && entry.is_dir {
                    format!("{}/", entry.path)
                } else {
                    entry.path.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(",");

        let mut response = if list.is_empty() {
            reply.ok()
        } else {
            reply.text(&list)
        };
        response.offset = flags as i32;
        response
    }

    /// A directory listing for directories, a read for everything else.
    async fn get(
        &self,
        path: &str,
        request: &Request,
        query: &QueryContext,
        reply: ResponseTemplate,
        slash: bool,
    ) -> QueryResult<Response> {
        let node = self.resolve(path, query).await?;
        if node.is_dir() {
            return Ok(self.dir_all_node(node, query, reply, slash).await);
        }
        let max = self.context.config().max_payload_size;
        let size = if request.size <= 0 {
            max
        } else {
            (request.size as usize).min(max)
        };
        self.read_node(node, size, request.offset, query, reply).await
    }
}
