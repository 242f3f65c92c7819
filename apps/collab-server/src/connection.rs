//! One WebSocket connection: a presence session plus a topic subscription

use collab_engine::{
    ActorId, BranchId, CollabError, CollabService, ConnectionInfo, DocumentId, NewComment,
    NewDocument, SessionId, SubmitOptions, SubscribeOptions, Subscription, SubscriptionId,
    VersionEvent,
};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::protocol::{ClientMessage, ServerMessage};

type Tx = mpsc::Sender<Message>;

const LAG_NOTICE_TIMEOUT: Duration = Duration::from_secs(1);

/// Document binding established by `join`
struct Membership {
    actor: ActorId,
    document_id: DocumentId,
    branch_id: Option<BranchId>,
    session_id: SessionId,
    subscription_id: SubscriptionId,
    subscription_cancel: CancellationToken,
    forward_task: JoinHandle<()>,
}

struct Connection {
    service: Arc<CollabService>,
    addr: SocketAddr,
    tx: Tx,
    /// Fired when the client fell behind and has to reconnect
    closing: CancellationToken,
    membership: Option<Membership>,
}

async fn send(tx: &Tx, msg: &ServerMessage) -> anyhow::Result<()> {
    let json = serde_json::to_string(msg)?;
    tx.send(Message::Text(json)).await?;
    Ok(())
}

/// Relay subscription events without waiting on a slow socket. A full
/// outgoing queue ends the subscription and closes the connection after a
/// resync notice.
async fn forward_events(mut subscription: Subscription, tx: Tx, closing: CancellationToken) {
    let mut overflowed = false;
    while let Some(envelope) = subscription.recv().await {
        let json = match serde_json::to_string(&ServerMessage::Event { envelope }) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to encode event: {}", e);
                continue;
            }
        };
        match tx.try_send(Message::Text(json)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                overflowed = true;
                break;
            }
            Err(TrySendError::Closed(_)) => return,
        }
    }
    if overflowed || subscription.is_lagged() {
        subscription.cancel();
        let notice = ServerMessage::error("lagged", "event queue overflowed; resync with snapshot");
        if tokio::time::timeout(LAG_NOTICE_TIMEOUT, send(&tx, &notice))
            .await
            .is_err()
        {
            debug!("Lag notice could not be queued");
        }
        closing.cancel();
    }
}

fn error_frame(err: &anyhow::Error) -> ServerMessage {
    match err.downcast_ref::<CollabError>() {
        Some(collab) => ServerMessage::error(collab.code(), collab.to_string()),
        None if err.is::<serde_json::Error>() => ServerMessage::error("bad_request", err.to_string()),
        None => ServerMessage::error("internal", err.to_string()),
    }
}

pub(crate) async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    service: Arc<CollabService>,
    shutdown: CancellationToken,
) {
    let ws_stream = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };
    info!("WebSocket connection established: {}", addr);

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let capacity = service.config().broadcast.subscriber_capacity.max(1);
    let (tx, mut rx) = mpsc::channel(capacity);

    // Task to send messages to client
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = ws_sender.send(msg).await {
                error!("Failed to send message: {}", e);
                break;
            }
        }
    });

    let closing = CancellationToken::new();
    let mut conn = Connection {
        service,
        addr,
        tx: tx.clone(),
        closing: closing.clone(),
        membership: None,
    };

    loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = closing.cancelled() => {
                warn!("Closing lagging connection {}", addr);
                break;
            }
            msg = ws_receiver.next() => msg,
        };
        let msg = match msg {
            Some(Ok(m)) => m,
            Some(Err(e)) => {
                error!("Error receiving message from {}: {}", addr, e);
                break;
            }
            None => break,
        };

        match msg {
            Message::Text(text) => {
                if let Err(e) = conn.handle_text(&text).await {
                    debug!("Request from {} failed: {}", addr, e);
                    let _ = send(&tx, &error_frame(&e)).await;
                }
            }
            Message::Ping(data) => {
                let _ = tx.send(Message::Pong(data)).await;
            }
            Message::Close(_) => {
                info!("Client {} requested close", addr);
                break;
            }
            _ => {}
        }
    }

    conn.leave();
    drop(conn);
    drop(tx);
    // Drain queued frames, then stop
    let mut send_task = send_task;
    if tokio::time::timeout(Duration::from_secs(1), &mut send_task)
        .await
        .is_err()
    {
        warn!("Outgoing queue for {} did not drain", addr);
        send_task.abort();
    }
    info!("Connection closed: {}", addr);
}

impl Connection {
    fn member(&self) -> anyhow::Result<&Membership> {
        self.membership
            .as_ref()
            .ok_or_else(|| {
                CollabError::Validation("connection has not joined a document".to_string()).into()
            })
    }

    async fn handle_text(&mut self, text: &str) -> anyhow::Result<()> {
        let msg: ClientMessage = serde_json::from_str(text)?;

        match msg {
            ClientMessage::CreateDocument { actor_id, name } => {
                let document = self
                    .service
                    .create_document(actor_id, NewDocument::new(name))
                    .await?;
                send(&self.tx, &ServerMessage::DocumentCreated { document }).await?;
            }

            ClientMessage::Join {
                document_id,
                actor_id,
                branch_id,
                client,
            } => self.join(document_id, actor_id, branch_id, client).await?,

            ClientMessage::Submit {
                operations,
                base_clock,
                strategy,
                resolutions,
            } => {
                let m = self.member()?;
                let outcome = self
                    .service
                    .submit_to_branch(
                        m.actor,
                        m.document_id,
                        operations,
                        &base_clock,
                        SubmitOptions {
                            branch_id: m.branch_id,
                            strategy,
                            resolutions,
                            session_id: Some(m.session_id),
                        },
                    )
                    .await?;
                send(&self.tx, &ServerMessage::Outcome { outcome }).await?;
            }

            ClientMessage::Presence { update } => {
                let m = self.member()?;
                self.service.update_presence(m.session_id, update)?;
            }

            ClientMessage::Heartbeat => {
                let m = self.member()?;
                self.service.heartbeat(m.session_id)?;
            }

            // Comment events echo to their origin, so the subscription answers these
            ClientMessage::Comment {
                anchor,
                body,
                parent_comment_id,
            } => {
                let m = self.member()?;
                self.service
                    .add_comment(
                        m.actor,
                        NewComment {
                            document_id: m.document_id,
                            anchor,
                            body,
                            parent_comment_id,
                        },
                        Some(m.session_id),
                    )
                    .await?;
            }

            ClientMessage::ResolveComment {
                comment_id,
                resolution,
                resolve_thread,
            } => {
                let m = self.member()?;
                self.service
                    .resolve_comment(
                        m.actor,
                        m.document_id,
                        comment_id,
                        resolution,
                        resolve_thread,
                        Some(m.session_id),
                    )
                    .await?;
            }

            ClientMessage::ReopenComment { comment_id } => {
                let m = self.member()?;
                self.service
                    .reopen_comment(m.actor, m.document_id, comment_id, Some(m.session_id))
                    .await?;
            }

            ClientMessage::CreateVersion { is_major } => {
                let m = self.member()?;
                let version = self
                    .service
                    .create_version(m.actor, m.document_id, m.branch_id, is_major)
                    .await?;
                send(
                    &self.tx,
                    &ServerMessage::Version {
                        version: VersionEvent::from(version.as_ref()),
                    },
                )
                .await?;
            }

            ClientMessage::CreateBranch { name } => {
                let m = self.member()?;
                let branch = self
                    .service
                    .create_branch(m.actor, m.document_id, &name, None)
                    .await?;
                send(
                    &self.tx,
                    &ServerMessage::BranchCreated {
                        branch_id: branch.id,
                        name: branch.name,
                    },
                )
                .await?;
            }

            ClientMessage::Merge {
                source_branch,
                target_branch,
                strategy,
                resolutions,
            } => {
                let m = self.member()?;
                let result = self
                    .service
                    .merge_branches(
                        m.actor,
                        m.document_id,
                        source_branch,
                        target_branch,
                        strategy,
                        resolutions,
                    )
                    .await?;
                send(&self.tx, &ServerMessage::MergeResult { result }).await?;
            }

            ClientMessage::Snapshot { branch_id } => {
                let m = self.member()?;
                let snapshot = self
                    .service
                    .document_snapshot(m.actor, m.document_id, branch_id.or(m.branch_id))
                    .await?;
                send(&self.tx, &ServerMessage::Snapshot { snapshot }).await?;
            }

            ClientMessage::Ping => send(&self.tx, &ServerMessage::Pong).await?,
        }

        Ok(())
    }

    async fn join(
        &mut self,
        document_id: DocumentId,
        actor: ActorId,
        branch_id: Option<BranchId>,
        client: Option<String>,
    ) -> anyhow::Result<()> {
        if let Some(m) = &self.membership {
            anyhow::bail!(CollabError::Validation(format!(
                "connection already joined document {}",
                m.document_id
            )));
        }

        // Hydrates from persistence when the document is not resident
        self.service.load_document(actor, document_id).await?;
        let session = self.service.join_document(
            actor,
            document_id,
            ConnectionInfo {
                client,
                device: None,
                remote_addr: Some(self.addr.to_string()),
            },
        )?;
        // Subscribe before the snapshot so no event falls between the two;
        // events it already covers are idempotent for the client
        let subscription = match self.service.subscribe(
            actor,
            document_id,
            SubscribeOptions {
                session_id: Some(session.id),
                kinds: Vec::new(),
            },
        ) {
            Ok(subscription) => subscription,
            Err(e) => {
                let _ = self.service.leave_document(session.id);
                return Err(e.into());
            }
        };

        let snapshot = match self
            .service
            .document_snapshot(actor, document_id, branch_id)
            .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                subscription.cancel();
                self.service
                    .broadcaster()
                    .unsubscribe(document_id, subscription.id());
                let _ = self.service.leave_document(session.id);
                return Err(e.into());
            }
        };

        info!(
            "Actor {} joined document {} from {} (session {})",
            actor, document_id, self.addr, session.id
        );
        let subscription_id = subscription.id();
        let subscription_cancel = subscription.cancellation_token();
        let joined = send(
            &self.tx,
            &ServerMessage::Joined {
                session: session.clone(),
                snapshot,
            },
        )
        .await;
        // Events queued since subscribing go out after the snapshot
        let forward_task = tokio::spawn(forward_events(
            subscription,
            self.tx.clone(),
            self.closing.clone(),
        ));
        self.membership = Some(Membership {
            actor,
            document_id,
            branch_id,
            session_id: session.id,
            subscription_id,
            subscription_cancel,
            forward_task,
        });
        joined
    }

    /// Tear down presence and subscription; accepted operations stay
    fn leave(&mut self) {
        let Some(m) = self.membership.take() else {
            return;
        };
        m.subscription_cancel.cancel();
        self.service
            .broadcaster()
            .unsubscribe(m.document_id, m.subscription_id);
        m.forward_task.abort();
        if let Err(e) = self.service.leave_document(m.session_id) {
            // Already pruned by the sweeper
            debug!("Session {} was gone at disconnect: {}", m.session_id, e);
        }
        info!(
            "Actor {} left document {} (session {})",
            m.actor, m.document_id, m.session_id
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use collab_engine::{
        ActivityEvent, ActivityImpact, ActivityType, AllowAllGate, BroadcastConfig, CollabEvent,
        EventBroadcaster,
    };

    fn activity(document: DocumentId) -> CollabEvent {
        CollabEvent::Activity(ActivityEvent::new(
            document,
            ActorId::new(),
            ActivityType::Document,
            "touched",
            ("document", document.0),
            ActivityImpact::minor(0),
        ))
    }

    fn frame(msg: Message) -> ServerMessage {
        match msg {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected a text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_full_outgoing_queue_closes_with_lag_notice() {
        let broadcaster =
            EventBroadcaster::new(BroadcastConfig::for_testing(), Arc::new(AllowAllGate));
        let doc = DocumentId::new();
        let subscription = broadcaster
            .subscribe(ActorId::new(), doc, SubscribeOptions::default())
            .unwrap();
        let subscription_cancel = subscription.cancellation_token();
        broadcaster.publish(doc, None, activity(doc));
        broadcaster.publish(doc, None, activity(doc));

        let (tx, mut rx) = mpsc::channel(1);
        let closing = CancellationToken::new();
        let task = tokio::spawn(forward_events(subscription, tx, closing.clone()));

        // The second event finds the queue full
        subscription_cancel.cancelled().await;
        assert!(matches!(frame(rx.recv().await.unwrap()), ServerMessage::Event { .. }));
        match frame(rx.recv().await.unwrap()) {
            ServerMessage::Error { code, .. } => assert_eq!(code, "lagged"),
            other => panic!("expected lag notice, got {other:?}"),
        }
        task.await.unwrap();
        assert!(closing.is_cancelled());
    }
}
