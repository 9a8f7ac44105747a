//! Dispatch of transactional requests
//!
//! [`TransactionHandler`] resolves the transaction a request names,
//! applies the request through the coordinators and turns every outcome,
//! success or error, into a [`Reply`]. It also runs connection teardown and
//! administrative rollback.

use crate::ack::{decode_ack_blocks, AckRecorder, AckRequest};
use crate::broker::protocol::{AckOwner, Reply, ReplyBody, Request, TransactionRef};
use crate::broker::BrokerContext;
use crate::error::{Result, Status, StreamlineError};
use crate::message::{ConnectionId, MessageId};
use crate::transaction::{
    AutoRollback, CommitCoordinator, Operation, RecoveryReport, RedeliverRequest, Redeliverer,
    RollbackCoordinator,
    RollbackOptions, RollbackOutcome, RollbackReason, TransactionId, TransactionState,
    TransactionStatus, XaFlags, Xid,
};

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Executes transactional requests for all connections of a broker
pub struct TransactionHandler {
    ctx: Arc<BrokerContext>,
    commits: CommitCoordinator,
    rollbacks: RollbackCoordinator,
    acks: AckRecorder,
    redeliverer: Redeliverer,
}

impl TransactionHandler {
    pub fn new(ctx: Arc<BrokerContext>) -> Self {
        Self {
            commits: CommitCoordinator::new(ctx.clone()),
            rollbacks: RollbackCoordinator::new(ctx.clone()),
            acks: AckRecorder::new(ctx.clone()),
            redeliverer: Redeliverer::new(ctx.clone()),
            ctx,
        }
    }

    pub fn context(&self) -> &Arc<BrokerContext> {
        &self.ctx
    }

    /// Execute one request on behalf of `connection`
    pub async fn handle(&self, connection: ConnectionId, request: Request) -> Reply {
        let name = request.name();
        match request {
            Request::Start {
                transaction,
                xid,
                flags,
                auto_rollback,
                sessionless,
                lifetime_ms,
                token,
            } => self
                .start(connection, transaction, xid, flags, auto_rollback, sessionless, lifetime_ms, token)
                .map(|id| Reply::ok().with_transaction(id))
                .unwrap_or_else(|e| self.fail(name, None, e)),

            Request::End { target, flags } => match self.resolve(&target, name) {
                Ok(Some(id)) => self
                    .end(id, flags)
                    .map(|_| Reply::ok().with_transaction(id))
                    .unwrap_or_else(|e| self.fail(name, Some(id), e)),
                Ok(None) => Reply::ok(),
                Err(e) => self.fail(name, target.id, e),
            },

            Request::Prepare {
                target,
                flags,
                one_phase,
            } => match self.resolve(&target, name) {
                Ok(Some(id)) => match self.commits.prepare(id, flags, one_phase).await {
                    Ok(_) => Reply::ok().with_transaction(id),
                    Err(e) => {
                        let failed = self
                            .ctx
                            .registry()
                            .get_state(id)
                            .is_some_and(|s| s.status == TransactionStatus::Failed);
                        let mut reply = self.fail(name, Some(id), e);
                        reply.prepare_failed = failed;
                        reply
                    }
                },
                Ok(None) => Reply::ok(),
                Err(e) => self.fail(name, target.id, e),
            },

            Request::Commit {
                target,
                flags,
                one_phase,
                start_next,
            } => match self.resolve(&target, name) {
                Ok(Some(id)) => match self.commits.commit(id, flags, one_phase).await {
                    Ok(_) => self.finish(connection, id, start_next),
                    Err(e) => self.fail(name, Some(id), e),
                },
                Ok(None) => Reply::ok(),
                Err(e) => self.fail(name, target.id, e),
            },

            Request::Rollback {
                target,
                flags,
                options,
                start_next,
            } => match self.resolve(&target, name) {
                Ok(Some(id)) => match self
                    .rollbacks
                    .rollback(id, flags, RollbackReason::Application, options)
                    .await
                {
                    Ok(_) => self.finish(connection, id, start_next),
                    Err(e) => self.fail(name, Some(id), e),
                },
                Ok(None) => Reply::ok(),
                Err(e) => self.fail(name, target.id, e),
            },

            Request::Recover { transaction, flags } => {
                Reply::ok().with_body(ReplyBody::Xids(self.recover(transaction, flags)))
            }

            Request::Verify { target } => match self.resolve(&target, name) {
                Ok(Some(id)) => self
                    .verify(id)
                    .map(|body| Reply::ok().with_transaction(id).with_body(body))
                    .unwrap_or_else(|e| self.fail(name, Some(id), e)),
                Ok(None) => Reply::ok(),
                Err(e) => self.fail(name, target.id, e),
            },

            Request::Ack {
                kind,
                body,
                transaction,
                validate,
                dead,
            } => {
                let result = decode_ack_blocks(&body).and_then(|entries| {
                    self.acks.process(&AckRequest {
                        kind,
                        entries,
                        transaction,
                        validate,
                        dead,
                    })
                });
                match result {
                    Ok(summary) => Reply::ok().with_body(ReplyBody::Ack(summary)),
                    Err(e) => self.fail(name, transaction, e),
                }
            }

            Request::Redeliver {
                body,
                set_redelivered,
                transaction,
            } => {
                let result = decode_ack_blocks(&body).and_then(|entries| {
                    self.redeliverer.redeliver(&RedeliverRequest {
                        entries,
                        set_redelivered,
                        transaction,
                    })
                });
                match result {
                    Ok(count) => Reply::ok().with_body(ReplyBody::Redelivered(count)),
                    Err(e) => self.fail(name, transaction, e),
                }
            }
        }
    }

    fn fail(&self, request: &str, id: Option<TransactionId>, err: StreamlineError) -> Reply {
        match err.status() {
            Status::Conflict | Status::NotModified => warn!(
                request,
                transaction_id = ?id,
                error = %err,
                "Transaction request rejected"
            ),
            _ if err.is_remote() => warn!(
                request,
                transaction_id = ?id,
                error = %err,
                consumers = ?err.affected_consumers(),
                "Transaction request failed on remote broker"
            ),
            _ if err.is_durability_failure() => error!(
                request,
                transaction_id = ?id,
                error = %err,
                "Transaction log write failed, request aborted"
            ),
            _ => error!(request, transaction_id = ?id, error = %err, "Transaction request failed"),
        }
        let reply = Reply::error(&err);
        match id {
            Some(id) => reply.with_transaction(id),
            None => reply,
        }
    }

    /// Reply for a finished COMMIT/ROLLBACK, starting the next transaction if asked
    fn finish(&self, connection: ConnectionId, id: TransactionId, start_next: bool) -> Reply {
        let reply = Reply::ok().with_transaction(id);
        if !start_next {
            return reply;
        }
        match self.create(
            connection,
            TransactionState::local(),
        ) {
            Ok(next) => reply.with_next_transaction(Some(next)),
            Err(e) => self.fail("START", None, e).with_transaction(id),
        }
    }

    /// Find the registered transaction a request names
    ///
    /// `Ok(None)` means a replayed request for a transaction that is gone.
    fn resolve(&self, target: &TransactionRef, request: &str) -> Result<Option<TransactionId>> {
        let registry = self.ctx.registry();

        let id = match (&target.xid, target.id) {
            (Some(xid), requested) => {
                let Some(id) = registry.id_for_xid(xid) else {
                    if target.replay {
                        debug!(request, %xid, "Replayed request for resolved Xid");
                        return Ok(None);
                    }
                    return Err(StreamlineError::UnknownXid(xid.to_string()));
                };
                if let Some(requested) = requested.filter(|r| *r != id) {
                    error!(
                        request,
                        %xid,
                        requested = %requested,
                        registered = %id,
                        "Transaction id does not match Xid, using registered transaction"
                    );
                }
                id
            }
            (None, Some(id)) => id,
            (None, None) => return Err(StreamlineError::protocol_missing("transaction id")),
        };

        if registry.contains(id) {
            return Ok(Some(id));
        }

        if target.replay {
            debug!(request, transaction_id = %id, "Replayed request for resolved transaction");
            return Ok(None);
        }
        if let Some(status) = registry.resolved(id) {
            warn!(request, transaction_id = %id, %status, "Request for already resolved transaction");
        }
        Err(StreamlineError::TransactionNotFound(id))
    }

    fn create(&self, connection: ConnectionId, state: TransactionState) -> Result<TransactionId> {
        let id = self.ctx.next_transaction_id();
        let state = state
            .with_connection(connection)
            .with_status(TransactionStatus::Started);
        self.ctx.registry().create(id, state)?;
        self.ctx.stats().record_started();
        debug!(transaction_id = %id, connection = %connection, "Transaction started");
        Ok(id)
    }

    #[allow(clippy::too_many_arguments)]
    fn start(
        &self,
        connection: ConnectionId,
        transaction: Option<TransactionId>,
        xid: Option<Xid>,
        flags: Option<XaFlags>,
        auto_rollback: AutoRollback,
        sessionless: bool,
        lifetime_ms: i64,
        token: Option<String>,
    ) -> Result<TransactionId> {
        let registry = self.ctx.registry();

        if let Some(existing) = token.as_deref().and_then(|t| registry.find_by_creator_token(t)) {
            debug!(transaction_id = %existing, "Replayed START, returning existing transaction");
            return Ok(existing);
        }
        if auto_rollback == AutoRollback::Never {
            return Err(StreamlineError::NotImplemented(
                "auto rollback policy NEVER".to_string(),
            ));
        }
        if lifetime_ms > 0 {
            return Err(StreamlineError::NotImplemented(
                "transaction lifetimes".to_string(),
            ));
        }

        match &xid {
            Some(_) if !sessionless => {
                return Err(StreamlineError::NotImplemented(
                    "XA transactions bound to a session".to_string(),
                ))
            }
            None if sessionless => {
                return Err(StreamlineError::protocol_invalid_field(
                    "sessionless",
                    "requires an Xid",
                ))
            }
            _ => {}
        }

        let joining = XaFlags::is_set(flags, XaFlags::JOIN) || XaFlags::is_set(flags, XaFlags::RESUME);

        if let Some(xid) = &xid {
            if let Some(existing) = registry.id_for_xid(xid) {
                if !joining {
                    return Err(StreamlineError::Conflict(format!(
                        "Xid {} already in use by {}",
                        xid, existing
                    )));
                }
                let state = registry.retrieve_state(existing)?;
                state.next_state(Operation::Start, flags)?;
                registry.update_state(existing, TransactionStatus::Started, true)?;
                registry.set_connection(existing, Some(connection))?;
                debug!(transaction_id = %existing, %xid, "Rejoined XA transaction");
                return Ok(existing);
            }
            if joining {
                return Err(StreamlineError::UnknownXid(xid.to_string()));
            }
        }

        if let Some(id) = transaction.filter(|id| registry.contains(*id)) {
            let state = registry.retrieve_state(id)?;
            state.next_state(Operation::Start, flags)?;
            registry.update_state(id, TransactionStatus::Started, true)?;
            return Ok(id);
        }

        let mut state = TransactionState::new(auto_rollback, xid).with_sessionless(sessionless);
        if let Some(token) = token {
            state = state.with_creator(token);
        }
        self.create(connection, state)
    }

    fn end(&self, id: TransactionId, flags: Option<XaFlags>) -> Result<()> {
        let registry = self.ctx.registry();
        let state = registry.retrieve_state(id)?;
        let next = state.next_state(Operation::End, flags)?;
        if next != state.status {
            registry.update_state(id, next, true)?;
        }
        if state.sessionless && !XaFlags::is_set(flags, XaFlags::SUSPEND) {
            registry.set_connection(id, None)?;
        }
        debug!(transaction_id = %id, status = %next, "Transaction ended");
        Ok(())
    }

    fn recover(&self, transaction: Option<TransactionId>, flags: Option<XaFlags>) -> Vec<Xid> {
        let registry = self.ctx.registry();
        match transaction {
            Some(id) => registry
                .get_state(id)
                .filter(|s| s.status == TransactionStatus::Prepared)
                .and_then(|s| s.xid)
                .into_iter()
                .collect(),
            None if XaFlags::is_set(flags, XaFlags::STARTRSCAN) => registry
                .in_status(TransactionStatus::Prepared)
                .into_iter()
                .filter_map(|(_, s)| s.xid)
                .collect(),
            None => Vec::new(),
        }
    }

    fn verify(&self, id: TransactionId) -> Result<ReplyBody> {
        let registry = self.ctx.registry();
        let state = registry.retrieve_state(id)?;
        let mut detail: BTreeMap<MessageId, Vec<AckOwner>> = BTreeMap::new();
        if state.status == TransactionStatus::Prepared {
            for ack in registry.transaction_work(id)?.acks {
                let broker = registry.ack_broker(id, ack.message).or_else(|| {
                    self.ctx
                        .store()
                        .lookup(ack.message)
                        .filter(|m| m.is_remote(self.ctx.local_broker()))
                        .and_then(|m| m.broker)
                });
                detail.entry(ack.message).or_default().push(AckOwner {
                    consumer: ack.consumer,
                    stored_consumer: ack.stored_consumer,
                    broker,
                });
            }
        }
        Ok(ReplyBody::Verify {
            status: state.status,
            detail,
        })
    }

    /// Clean up the transactions of a closed connection
    pub async fn connection_closed(&self, connection: ConnectionId) {
        let registry = self.ctx.registry();
        for id in registry.for_connection(connection) {
            let Some(state) = registry.get_state(id) else {
                continue;
            };
            if state.is_xa() && state.sessionless {
                if let Err(e) = registry.set_connection(id, None) {
                    warn!(transaction_id = %id, error = %e, "Failed to detach transaction");
                } else {
                    info!(transaction_id = %id, connection = %connection, "Detached sessionless transaction");
                }
                continue;
            }
            if state.status == TransactionStatus::Prepared {
                info!(transaction_id = %id, connection = %connection, "Leaving prepared transaction in doubt");
                continue;
            }
            if let Err(e) = self
                .rollbacks
                .rollback(
                    id,
                    None,
                    RollbackReason::ConnectionCleanup,
                    RollbackOptions::default(),
                )
                .await
            {
                warn!(transaction_id = %id, error = %e, "Failed to roll back transaction of closed connection");
            }
        }
    }

    /// Restore the transaction log and finish commits cut short by a restart
    ///
    /// Prepared transactions stay in doubt for their coordinator. Committed
    /// ones have their outcome logged already, so their work is applied here.
    pub async fn recover_log(&self) -> Result<RecoveryReport> {
        let report = self.ctx.recover()?;
        for txn in &report.committed {
            let id = txn.id();
            if let Err(e) = self.commits.redrive(id).await {
                error!(transaction_id = %id, error = %e, "Failed to complete committed transaction");
            }
        }
        info!(
            in_doubt = report.in_doubt.len(),
            committed = report.committed.len(),
            "Transaction log recovered"
        );
        Ok(report)
    }

    /// Roll back a transaction on behalf of an administrator
    pub async fn admin_rollback(&self, id: TransactionId) -> Result<RollbackOutcome> {
        self.rollbacks
            .rollback(id, None, RollbackReason::Admin, RollbackOptions::default())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestBroker;

    fn handler(broker: &TestBroker) -> TransactionHandler {
        TransactionHandler::new(broker.ctx.clone())
    }

    fn xid(n: u8) -> Xid {
        Xid::new(0x1234, &[n], b"branch").unwrap()
    }

    #[tokio::test]
    async fn test_start_is_idempotent_by_token() {
        let broker = TestBroker::new();
        let handler = handler(&broker);
        let start = Request::Start {
            transaction: None,
            xid: None,
            flags: None,
            auto_rollback: AutoRollback::All,
            sessionless: false,
            lifetime_ms: 0,
            token: Some("req-1".to_string()),
        };
        let first = handler.handle(ConnectionId(1), start.clone()).await;
        let second = handler.handle(ConnectionId(1), start).await;
        assert!(first.is_ok());
        assert_eq!(first.transaction_id, second.transaction_id);
        assert_eq!(broker.ctx.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_start_rejections() {
        let broker = TestBroker::new();
        let handler = handler(&broker);

        let reply = handler
            .handle(
                ConnectionId(1),
                Request::Start {
                    transaction: None,
                    xid: None,
                    flags: None,
                    auto_rollback: AutoRollback::All,
                    sessionless: false,
                    lifetime_ms: 1000,
                    token: None,
                },
            )
            .await;
        assert_eq!(reply.status, Status::NotImplemented);

        let reply = handler
            .handle(
                ConnectionId(1),
                Request::Start {
                    transaction: None,
                    xid: None,
                    flags: None,
                    auto_rollback: AutoRollback::All,
                    sessionless: true,
                    lifetime_ms: 0,
                    token: None,
                },
            )
            .await;
        assert_eq!(reply.status, Status::BadRequest);

        assert!(handler.handle(ConnectionId(1), Request::start_xa(xid(1))).await.is_ok());
        let reply = handler.handle(ConnectionId(1), Request::start_xa(xid(1))).await;
        assert_eq!(reply.status, Status::Conflict);
    }

    #[tokio::test]
    async fn test_end_without_flags_is_rejected() {
        let broker = TestBroker::new();
        let handler = handler(&broker);
        let started = handler.handle(ConnectionId(1), Request::start_xa(xid(9))).await;
        let id = started.transaction_id.unwrap();

        let reply = handler
            .handle(
                ConnectionId(1),
                Request::End {
                    target: TransactionRef::xid(xid(9)),
                    flags: None,
                },
            )
            .await;
        assert_eq!(reply.status, Status::Conflict);
        assert_eq!(
            broker.ctx.registry().retrieve_state(id).unwrap().status,
            TransactionStatus::Started
        );
    }

    #[tokio::test]
    async fn test_xa_two_phase_flow_and_recover() {
        let broker = TestBroker::new();
        let handler = handler(&broker);
        let xid = xid(2);

        let started = handler.handle(ConnectionId(1), Request::start_xa(xid.clone())).await;
        let id = started.transaction_id.unwrap();

        let end = handler
            .handle(
                ConnectionId(1),
                Request::End {
                    target: TransactionRef::xid(xid.clone()),
                    flags: Some(XaFlags::SUCCESS),
                },
            )
            .await;
        assert!(end.is_ok());

        let prepare = handler
            .handle(
                ConnectionId(1),
                Request::Prepare {
                    target: TransactionRef::xid(xid.clone()),
                    flags: None,
                    one_phase: false,
                },
            )
            .await;
        assert!(prepare.is_ok());

        let scan = handler
            .handle(
                ConnectionId(2),
                Request::Recover {
                    transaction: None,
                    flags: Some(XaFlags::STARTRSCAN),
                },
            )
            .await;
        assert_eq!(scan.body, ReplyBody::Xids(vec![xid.clone()]));

        let no_scan = handler
            .handle(
                ConnectionId(2),
                Request::Recover {
                    transaction: None,
                    flags: None,
                },
            )
            .await;
        assert_eq!(no_scan.body, ReplyBody::Xids(vec![]));

        let commit = handler
            .handle(
                ConnectionId(2),
                Request::Commit {
                    target: TransactionRef::xid(xid.clone()),
                    flags: None,
                    one_phase: false,
                    start_next: false,
                },
            )
            .await;
        assert!(commit.is_ok());
        assert!(!broker.ctx.registry().contains(id));

        // a replayed commit is not an error
        let replay = handler
            .handle(
                ConnectionId(2),
                Request::Commit {
                    target: TransactionRef::id(id).replayed(),
                    flags: None,
                    one_phase: false,
                    start_next: false,
                },
            )
            .await;
        assert!(replay.is_ok());
    }

    #[tokio::test]
    async fn test_missing_and_unknown_targets() {
        let broker = TestBroker::new();
        let handler = handler(&broker);

        let reply = handler
            .handle(
                ConnectionId(1),
                Request::Commit {
                    target: TransactionRef::default(),
                    flags: None,
                    one_phase: false,
                    start_next: false,
                },
            )
            .await;
        assert_eq!(reply.status, Status::BadRequest);

        let reply = handler
            .handle(
                ConnectionId(1),
                Request::Verify {
                    target: TransactionRef::xid(xid(9)),
                },
            )
            .await;
        assert_eq!(reply.status, Status::BadRequest);

        let reply = handler
            .handle(
                ConnectionId(1),
                Request::Rollback {
                    target: TransactionRef::id(TransactionId(777)),
                    flags: None,
                    options: RollbackOptions::default(),
                    start_next: false,
                },
            )
            .await;
        assert_eq!(reply.status, Status::NotFound);
    }

    #[tokio::test]
    async fn test_commit_with_start_next() {
        let broker = TestBroker::new();
        let handler = handler(&broker);
        let id = handler
            .handle(ConnectionId(1), Request::start_local())
            .await
            .transaction_id
            .unwrap();

        let reply = handler
            .handle(
                ConnectionId(1),
                Request::Commit {
                    target: TransactionRef::id(id),
                    flags: None,
                    one_phase: false,
                    start_next: true,
                },
            )
            .await;
        assert!(reply.is_ok());
        let next = reply.next_transaction_id.unwrap();
        assert_ne!(next, id);
        assert_eq!(
            broker.ctx.registry().retrieve_state(next).unwrap().status,
            TransactionStatus::Started
        );
    }

    #[tokio::test]
    async fn test_connection_closed_cleanup() {
        let broker = TestBroker::new();
        let handler = handler(&broker);

        let local = handler
            .handle(ConnectionId(5), Request::start_local())
            .await
            .transaction_id
            .unwrap();
        let xa = handler
            .handle(ConnectionId(5), Request::start_xa(xid(3)))
            .await
            .transaction_id
            .unwrap();

        handler.connection_closed(ConnectionId(5)).await;

        assert!(!broker.ctx.registry().contains(local));
        assert_eq!(
            broker.ctx.registry().resolved(local),
            Some(TransactionStatus::RolledBack)
        );
        let state = broker.ctx.registry().retrieve_state(xa).unwrap();
        assert!(state.detached);
        assert_eq!(state.status, TransactionStatus::Started);
    }

    #[tokio::test]
    async fn test_end_on_failed_transaction_is_not_modified() {
        let broker = TestBroker::new();
        let handler = handler(&broker);
        let xid = xid(4);
        let id = handler
            .handle(ConnectionId(1), Request::start_xa(xid.clone()))
            .await
            .transaction_id
            .unwrap();
        broker
            .ctx
            .registry()
            .update_state(id, TransactionStatus::Failed, false)
            .unwrap();

        let reply = handler
            .handle(
                ConnectionId(1),
                Request::End {
                    target: TransactionRef::xid(xid),
                    flags: Some(XaFlags::SUCCESS),
                },
            )
            .await;
        assert_eq!(reply.status, Status::NotModified);
    }
}
