//! Keep-alive pulses while a request is being worked on.
//!
//! The request runs as its own task. Meanwhile [`supervise`] waits for its answer with a
//! timeout and sends an empty keep-alive response whenever the connection has been quiet
//! for a full tick. Every write, pulse or real response, goes through [`Outbound`], whose
//! lock keeps messages from interleaving.
use std::{future::Future, io, sync::Arc, time::Duration};

use futures::SinkExt;
use nix::errno::Errno;
use ownet_protocol::{Response, tokio_codec::ServerCodec};
use tokio::{
    io::AsyncWrite,
    sync::{Mutex, oneshot},
    time::timeout,
};
use tokio_util::codec::FramedWrite;

use crate::{dispatch::ResponseTemplate, server::Config, sidetap::Tap};

/// What was last written on the connection.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Activity {
    /// A keep-alive, or nothing yet
    PostPing,
    /// A regular response, which proves liveness as well
    PostMessage,
}

struct Channel<W> {
    sink: FramedWrite<W, ServerCodec>,
    activity: Activity,
}

/// The writing half of a connection, shared by the session, the request worker and the
/// keep-alive loop.
pub(crate) struct Outbound<W> {
    channel: Arc<Mutex<Channel<W>>>,
    /// Receives a copy of every response, keep-alives excepted
    tap: Option<Tap>,
}

impl<W> Clone for Outbound<W> {
    fn clone(&self) -> Self {
        Outbound {
            channel: Arc::clone(&self.channel),
            tap: self.tap.clone(),
        }
    }
}

impl<W: AsyncWrite + Unpin> Outbound<W> {
    pub(crate) fn new(writer: W) -> Outbound<W> {
        Outbound::with_tap(writer, None)
    }

    pub(crate) fn with_tap(writer: W, tap: Option<Tap>) -> Outbound<W> {
        Outbound {
            channel: Arc::new(Mutex::new(Channel {
                sink: FramedWrite::new(writer, ServerCodec::default()),
                activity: Activity::PostPing,
            })),
            tap,
        }
    }

    /// Writes one complete response.
    pub(crate) async fn send(&self, response: Response) -> io::Result<()> {
        let mut channel = self.channel.lock().await;
        log::debug!(
            "Response ret={} size={} offset={} payload={}",
            response.ret,
            response.size,
            response.offset,
            response.payload_len()
        );
        log::trace!("Response data: {:02x?}", &response.data[..]);
        // Copied under the channel lock, so copies keep the order of the connection
        if let Some(tap) = &self.tap {
            tap.response(&response).await;
        }
        channel.sink.send(response).await?;
        channel.activity = Activity::PostMessage;
        Ok(())
    }

    async fn ping(&self, ping: &Response) -> io::Result<()> {
        let mut channel = self.channel.lock().await;
        log::debug!("Sending keep-alive");
        channel.sink.send(ping.clone()).await?;
        channel.activity = Activity::PostPing;
        Ok(())
    }

    async fn begin(&self) {
        self.channel.lock().await.activity = Activity::PostPing;
    }

    /// Called when a tick passed without an answer. Pings unless a message went out since
    /// the last tick, and returns whether to wait a long or a short tick next.
    async fn tick(&self, ping: &Response) -> io::Result<Tier> {
        let mut channel = self.channel.lock().await;
        match channel.activity {
            Activity::PostMessage => {
                channel.activity = Activity::PostPing;
                Ok(Tier::Short)
            }
            Activity::PostPing => {
                log::debug!("Request still running, sending keep-alive");
                channel.sink.send(ping.clone()).await?;
                Ok(Tier::Long)
            }
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Tier {
    Short,
    Long,
}

/// Keep-alive timing of one server.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Pulse {
    pub short: Duration,
    pub long: Duration,
    pub eager: bool,
}

impl Pulse {
    pub(crate) fn from_config(config: &Config) -> Pulse {
        Pulse {
            short: config.keepalive_short,
            long: config.keepalive_long,
            eager: config.ping_crazy,
        }
    }

    fn wait(&self, tier: Tier) -> Duration {
        match tier {
            Tier::Short => self.short,
            Tier::Long => self.long,
        }
    }
}

/// Runs `work` to completion on its own task, pulsing the client until it answers, then
/// sends the answer.
///
/// Returning early with an error (the client went away) does not stop `work`.
pub(crate) async fn supervise<W, F>(
    outbound: &Outbound<W>,
    reply: ResponseTemplate,
    pulse: Pulse,
    work: F,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    F: Future<Output = Response> + Send + 'static,
{
    let (done_tx, mut done) = oneshot::channel();
    let mut worker = tokio::spawn(async move {
        let response = work.await;
        // The receiver is gone if the client disconnected
        let _ = done_tx.send(response);
    });

    let ping = reply.keepalive();
    outbound.begin().await;
    if pulse.eager {
        outbound.ping(&ping).await?;
    }

    let mut wait = pulse.long;
    loop {
        match timeout(wait, &mut done).await {
            Ok(Ok(response)) => return outbound.send(response).await,
            Ok(Err(_)) => break,
            Err(_) => wait = pulse.wait(outbound.tick(&ping).await?),
        }
    }

    // No answer will arrive. Keep the client alive until the worker is gone for sure.
    log::warn!("Request worker stopped without answering");
    loop {
        tokio::select! {
            joined = &mut worker => {
                if let Err(e) = joined {
                    log::error!("Request worker failed: {}", e);
                }
                break;
            }
            _ = tokio::time::sleep(wait) => outbound.ping(&ping).await?,
        }
    }
    outbound.send(reply.error(Errno::EIO)).await
}
