//! Host-facing gRPC services: session discovery/release and signaling.

use std::sync::Arc;
use std::time::Duration;

use cloudplay_protocol::{SessionId, SessionIdError};
use cloudplay_protocol::proto::broker_server::{self, BrokerServer};
use cloudplay_protocol::proto::signaling_server::{self, SignalingServer};
use cloudplay_protocol::proto::{
    DeleteSessionRequest, DeleteSessionResponse, FindSessionRequest, FindSessionResponse,
    GameMetadataBody, GetGameMetadataRequest, GetGameMetadataResponse,
    ReceiveSignalingOfferRequest, ReceiveSignalingOfferResponse, SendSignalingAnswerRequest,
    SendSignalingAnswerResponse, SignalingOffer, TrickleSignalingRequest,
    TrickleSignalingResponse, WatchSessionRequest, WatchSessionResponse,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};

use crate::broker::{Broker, BrokerError};
use crate::signaling::{Queue, SignalingError};

impl From<BrokerError> for Status {
    fn from(err: BrokerError) -> Self {
        match &err {
            BrokerError::SessionNotFound(_) => Status::not_found(err.to_string()),
            BrokerError::NotOwner { .. }
            | BrokerError::MetadataVanished { .. }
            | BrokerError::MetadataNotFound(_)
            | BrokerError::InvalidArgument(_) => Status::failed_precondition(err.to_string()),
            _ => {
                tracing::error!("Broker failure: {err}");
                Status::internal(err.to_string())
            }
        }
    }
}

impl From<SignalingError> for Status {
    fn from(err: SignalingError) -> Self {
        match err {
            SignalingError::AnswerAlreadySent => Status::failed_precondition(err.to_string()),
            SignalingError::Closed => Status::not_found(err.to_string()),
            SignalingError::Cancelled => Status::cancelled(err.to_string()),
            SignalingError::Timeout => Status::deadline_exceeded(err.to_string()),
        }
    }
}

fn parse_session_id(raw: &str) -> Result<SessionId, Status> {
    raw.parse()
        .map_err(|e: SessionIdError| Status::failed_precondition(e.to_string()))
}

pub struct BrokerService {
    broker: Arc<Broker>,
    watch_interval: Duration,
}

impl BrokerService {
    pub fn new(broker: Arc<Broker>, watch_interval: Duration) -> Self {
        Self {
            broker,
            watch_interval,
        }
    }

    pub fn into_server(self) -> BrokerServer<Self> {
        BrokerServer::new(self)
    }
}

#[tonic::async_trait]
impl broker_server::Broker for BrokerService {
    async fn find_session(
        &self,
        request: Request<FindSessionRequest>,
    ) -> Result<Response<FindSessionResponse>, Status> {
        let host_id = request.into_inner().allocated_server_id;
        if host_id.is_empty() {
            return Err(Status::failed_precondition("invalid allocated server ID"));
        }
        let resp = match self.broker.find_session(&host_id).await? {
            Some(res) => FindSessionResponse {
                found: true,
                session: Some(res.session.to_proto(Some(res.metadata_body))),
            },
            None => FindSessionResponse::default(),
        };
        Ok(Response::new(resp))
    }

    type WatchSessionStream = ReceiverStream<Result<WatchSessionResponse, Status>>;

    async fn watch_session(
        &self,
        request: Request<WatchSessionRequest>,
    ) -> Result<Response<Self::WatchSessionStream>, Status> {
        let host_id = request.into_inner().allocated_server_id;
        if host_id.is_empty() {
            return Err(Status::failed_precondition("invalid allocated server ID"));
        }

        let (tx, rx) = mpsc::channel(4);
        let broker = Arc::clone(&self.broker);
        let period = self.watch_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut found = false;
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = ticker.tick() => {}
                }
                let update = match broker.find_session(&host_id).await {
                    Ok(Some(res)) if !found => {
                        tracing::info!(%host_id, session_id = %res.session.id, "Watched host got a session");
                        found = true;
                        WatchSessionResponse {
                            found: true,
                            session: Some(res.session.to_proto(Some(res.metadata_body))),
                        }
                    }
                    Ok(None) if found => {
                        found = false;
                        WatchSessionResponse::default()
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = tx.send(Err(e.into())).await;
                        break;
                    }
                };
                if tx.send(Ok(update)).await.is_err() {
                    break;
                }
            }
            tracing::debug!(%host_id, "Session watch ended");
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn delete_session(
        &self,
        request: Request<DeleteSessionRequest>,
    ) -> Result<Response<DeleteSessionResponse>, Status> {
        let req = request.into_inner();
        let session_id = parse_session_id(&req.session_id)?;
        self.broker
            .delete_session(session_id, &req.allocated_server_id)
            .await?;
        Ok(Response::new(DeleteSessionResponse {}))
    }

    async fn get_game_metadata(
        &self,
        request: Request<GetGameMetadataRequest>,
    ) -> Result<Response<GetGameMetadataResponse>, Status> {
        let game_id = request.into_inner().game_id;
        let metadata = self.broker.game_metadata(&game_id).await?;
        let body = metadata.to_body().map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(GetGameMetadataResponse {
            game_metadata: Some(GameMetadataBody { body }),
        }))
    }
}

pub struct SignalingService {
    broker: Arc<Broker>,
}

impl SignalingService {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }

    pub fn into_server(self) -> SignalingServer<Self> {
        SignalingServer::new(self)
    }
}

#[tonic::async_trait]
impl signaling_server::Signaling for SignalingService {
    async fn receive_signaling_offer(
        &self,
        request: Request<ReceiveSignalingOfferRequest>,
    ) -> Result<Response<ReceiveSignalingOfferResponse>, Status> {
        let session_id = parse_session_id(&request.into_inner().session_id)?;
        if !self.broker.session_exists(session_id).await? {
            return Ok(Response::new(ReceiveSignalingOfferResponse::default()));
        }
        let Some(channels) = self.broker.channels().get(session_id).await else {
            return Ok(Response::new(ReceiveSignalingOfferResponse::default()));
        };
        let resp = match channels.try_pop(Queue::Offer)? {
            Some(body) => {
                tracing::info!(%session_id, "Offer handed to host");
                ReceiveSignalingOfferResponse {
                    found: true,
                    offer: Some(SignalingOffer { body }),
                }
            }
            None => ReceiveSignalingOfferResponse::default(),
        };
        Ok(Response::new(resp))
    }

    async fn send_signaling_answer(
        &self,
        request: Request<SendSignalingAnswerRequest>,
    ) -> Result<Response<SendSignalingAnswerResponse>, Status> {
        let req = request.into_inner();
        let session_id = parse_session_id(&req.session_id)?;
        let body = req
            .signaling_answer
            .map(|a| a.body)
            .ok_or_else(|| Status::failed_precondition("signaling_answer is required"))?;
        if !self.broker.session_exists(session_id).await? {
            return Err(BrokerError::SessionNotFound(session_id).into());
        }

        let channels = self
            .broker
            .channels()
            .get(session_id)
            .await
            .ok_or(BrokerError::SessionNotFound(session_id))?;
        // A dropped request future abandons the push with it.
        channels.submit_answer(body, &CancellationToken::new()).await?;
        tracing::info!(%session_id, "Answer queued for player");
        Ok(Response::new(SendSignalingAnswerResponse {}))
    }

    type TrickleSignalingStream = ReceiverStream<Result<TrickleSignalingResponse, Status>>;

    async fn trickle_signaling(
        &self,
        request: Request<Streaming<TrickleSignalingRequest>>,
    ) -> Result<Response<Self::TrickleSignalingStream>, Status> {
        let mut inbound = request.into_inner();
        let first = inbound
            .message()
            .await?
            .ok_or_else(|| Status::failed_precondition("trickle stream ended before first candidate"))?;
        let session_id = parse_session_id(&first.session_id)?;
        if !self.broker.session_exists(session_id).await? {
            return Err(BrokerError::SessionNotFound(session_id).into());
        }

        let channels = self
            .broker
            .channels()
            .get(session_id)
            .await
            .ok_or(BrokerError::SessionNotFound(session_id))?;
        // Shared by both directions; either side ending stops the other.
        let stream_scope = CancellationToken::new();
        channels
            .push(Queue::AnswerCandidates, first.body().to_string(), &stream_scope)
            .await?;
        tracing::debug!(%session_id, "Trickle stream opened");

        let (tx, rx) = mpsc::channel(16);

        // Player candidates -> host.
        {
            let channels = Arc::clone(&channels);
            let scope = stream_scope.clone();
            tokio::spawn(async move {
                loop {
                    let body = tokio::select! {
                        _ = tx.closed() => break,
                        res = channels.pop(Queue::OfferCandidates, &scope) => match res {
                            Ok(body) => body,
                            Err(SignalingError::Closed) => {
                                let _ = tx.send(Err(SignalingError::Closed.into())).await;
                                break;
                            }
                            Err(_) => break,
                        },
                    };
                    let msg = TrickleSignalingResponse::new(session_id.to_string(), body);
                    if tx.send(Ok(msg)).await.is_err() {
                        break;
                    }
                }
                scope.cancel();
            });
        }

        // Host candidates -> player.
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = stream_scope.cancelled() => break,
                    next = inbound.message() => next,
                };
                match next {
                    Ok(Some(msg)) => {
                        if let Err(e) = channels
                            .push(Queue::AnswerCandidates, msg.body().to_string(), &stream_scope)
                            .await
                        {
                            tracing::debug!(%session_id, "Trickle inbound stopped: {e}");
                            break;
                        }
                    }
                    Ok(None) => {
                        tracing::debug!(%session_id, "Host closed trickle stream");
                        break;
                    }
                    Err(status) => {
                        tracing::debug!(%session_id, "Trickle stream error: {status}");
                        break;
                    }
                }
            }
            stream_scope.cancel();
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

/// Serve both host-facing services on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    broker: Arc<Broker>,
    watch_interval: Duration,
    shutdown: impl std::future::Future<Output = ()> + Send,
) -> Result<(), tonic::transport::Error> {
    tonic::transport::Server::builder()
        .add_service(BrokerService::new(Arc::clone(&broker), watch_interval).into_server())
        .add_service(SignalingService::new(broker).into_server())
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::FixedAllocator;
    use crate::metadata::InMemoryMetadataStore;
    use crate::session::InMemorySessionStore;
    use crate::signaling::ChannelRegistry;
    use cloudplay_protocol::GameMetadata;
    use cloudplay_protocol::proto::SignalingAnswer;
    use cloudplay_protocol::proto::broker_server::Broker as _;
    use cloudplay_protocol::proto::signaling_server::Signaling as _;
    use tokio_stream::StreamExt;

    fn broker() -> Arc<Broker> {
        Arc::new(Broker::new(
            Arc::new(InMemorySessionStore::new()),
            Arc::new(InMemoryMetadataStore::from_games([GameMetadata::new(
                "chess", "chess",
            )])),
            Arc::new(FixedAllocator::new("host-x")),
            ChannelRegistry::new(10),
        ))
    }

    fn answer(session_id: SessionId, body: &str) -> Request<SendSignalingAnswerRequest> {
        Request::new(SendSignalingAnswerRequest {
            session_id: session_id.to_string(),
            signaling_answer: Some(SignalingAnswer { body: body.into() }),
        })
    }

    #[tokio::test]
    async fn find_session_requires_host_id() {
        let svc = BrokerService::new(broker(), Duration::from_millis(10));
        let err = svc
            .find_session(Request::new(FindSessionRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn find_session_miss_then_hit() {
        let broker = broker();
        let svc = BrokerService::new(Arc::clone(&broker), Duration::from_millis(10));
        let req = || {
            Request::new(FindSessionRequest {
                allocated_server_id: "host-x".into(),
            })
        };
        assert!(!svc.find_session(req()).await.unwrap().into_inner().found);

        let session = broker.new_game("chess").await.unwrap();
        let resp = svc.find_session(req()).await.unwrap().into_inner();
        assert!(resp.found);
        let wire = resp.session.unwrap();
        assert_eq!(wire.session_id, session.id.to_string());
        assert_eq!(wire.state, "signaling");
        let body = wire.game_metadata.unwrap().body;
        assert_eq!(GameMetadata::from_body(&body).unwrap().game_id, "chess");
    }

    #[tokio::test]
    async fn delete_session_status_codes() {
        let broker = broker();
        let svc = BrokerService::new(Arc::clone(&broker), Duration::from_millis(10));
        let session = broker.new_game("chess").await.unwrap();
        let req = |host: &str| {
            Request::new(DeleteSessionRequest {
                session_id: session.id.to_string(),
                allocated_server_id: host.into(),
            })
        };

        let err = svc.delete_session(req("host-y")).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::FailedPrecondition);
        svc.delete_session(req("host-x")).await.unwrap();
        let err = svc.delete_session(req("host-x")).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::NotFound);

        let err = svc
            .delete_session(Request::new(DeleteSessionRequest {
                session_id: "garbage".into(),
                allocated_server_id: "host-x".into(),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn get_game_metadata_missing_is_failed_precondition() {
        let svc = BrokerService::new(broker(), Duration::from_millis(10));
        let ok = svc
            .get_game_metadata(Request::new(GetGameMetadataRequest {
                game_id: "chess".into(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(ok.game_metadata.unwrap().body.contains("chess"));

        let err = svc
            .get_game_metadata(Request::new(GetGameMetadataRequest {
                game_id: "pong".into(),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn watch_session_emits_found_and_lost_edges() {
        let broker = broker();
        let svc = BrokerService::new(Arc::clone(&broker), Duration::from_millis(10));
        let mut stream = svc
            .watch_session(Request::new(WatchSessionRequest {
                allocated_server_id: "host-x".into(),
            }))
            .await
            .unwrap()
            .into_inner();

        let session = broker.new_game("chess").await.unwrap();
        let limit = Duration::from_secs(2);
        let found = tokio::time::timeout(limit, stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(found.found);
        assert_eq!(found.session.unwrap().session_id, session.id.to_string());

        broker.delete_session(session.id, "host-x").await.unwrap();
        let lost = tokio::time::timeout(limit, stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!lost.found);
        assert!(lost.session.is_none());
    }

    #[tokio::test]
    async fn receive_offer_is_a_poll() {
        let broker = broker();
        let svc = SignalingService::new(Arc::clone(&broker));
        let unknown = svc
            .receive_signaling_offer(Request::new(ReceiveSignalingOfferRequest {
                session_id: SessionId::new().to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(!unknown.found);

        let session = broker.new_game("chess").await.unwrap();
        let req = || {
            Request::new(ReceiveSignalingOfferRequest {
                session_id: session.id.to_string(),
            })
        };
        assert!(!svc.receive_signaling_offer(req()).await.unwrap().into_inner().found);

        let channels = broker.channels().get_or_create(session.id).await;
        channels
            .submit_offer("OFFER".into(), &CancellationToken::new())
            .await
            .unwrap();
        let resp = svc.receive_signaling_offer(req()).await.unwrap().into_inner();
        assert!(resp.found);
        assert_eq!(resp.offer.unwrap().body, "OFFER");
        assert!(!svc.receive_signaling_offer(req()).await.unwrap().into_inner().found);
    }

    #[tokio::test]
    async fn second_answer_is_failed_precondition() {
        let broker = broker();
        let svc = SignalingService::new(Arc::clone(&broker));
        let session = broker.new_game("chess").await.unwrap();

        svc.send_signaling_answer(answer(session.id, "A1")).await.unwrap();
        let err = svc
            .send_signaling_answer(answer(session.id, "A2"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::FailedPrecondition);

        let channels = broker.channels().get_or_create(session.id).await;
        assert_eq!(channels.try_pop(Queue::Answer).unwrap(), Some("A1".to_string()));
        assert_eq!(channels.try_pop(Queue::Answer).unwrap(), None);
    }

    #[tokio::test]
    async fn answer_for_unknown_session_is_not_found() {
        let svc = SignalingService::new(broker());
        let err = svc
            .send_signaling_answer(answer(SessionId::new(), "A"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn blocked_answer_released_by_session_delete() {
        let broker = Arc::new(Broker::new(
            Arc::new(InMemorySessionStore::new()),
            Arc::new(InMemoryMetadataStore::from_games([GameMetadata::new(
                "chess", "chess",
            )])),
            Arc::new(FixedAllocator::new("host-x")),
            ChannelRegistry::new(1),
        ));
        let svc = Arc::new(SignalingService::new(Arc::clone(&broker)));
        let session = broker.new_game("chess").await.unwrap();
        let channels = broker.channels().get_or_create(session.id).await;
        // Fill the single-slot answer queue so the next answer blocks.
        channels
            .push(Queue::Answer, "stale".into(), &CancellationToken::new())
            .await
            .unwrap();

        let pending = {
            let svc = Arc::clone(&svc);
            let id = session.id;
            tokio::spawn(async move { svc.send_signaling_answer(answer(id, "A")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.delete_session(session.id, "host-x").await.unwrap();

        let status = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::NotFound);
    }

    #[test]
    fn signaling_error_codes() {
        let code = |e: SignalingError| Status::from(e).code();
        assert_eq!(code(SignalingError::AnswerAlreadySent), tonic::Code::FailedPrecondition);
        assert_eq!(code(SignalingError::Closed), tonic::Code::NotFound);
        assert_eq!(code(SignalingError::Cancelled), tonic::Code::Cancelled);
        assert_eq!(code(SignalingError::Timeout), tonic::Code::DeadlineExceeded);
    }
}
