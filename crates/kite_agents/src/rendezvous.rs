//! Rendezvous agent.
//!
//! Listens under a rendezvous prefix for update requests, validates them
//! against the configured [`Validator`], and answers each accepted request
//! with a signed [`Acknowledgment`]. Rejected requests get no answer at all;
//! the producer sees its request time out.

use std::future::{Future, pending};
use std::sync::Arc;

use kite_network::{Face, Name, PrefixRegistration, Query, Signer, ValidationError, Validator};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::error::{CodecError, MobilityError};
use crate::messages::{Acknowledgment, PrefixAnnouncement, UpdateRequest};
use crate::options::RendezvousOptions;
use crate::signal::Signal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendezvousState {
    Idle,
    Listening,
}

/// What a single [`RendezvousAgent::step`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum RendezvousEvent {
    /// An update request arrived and is being validated.
    Received { name: Name },
    /// A request passed validation and was acknowledged.
    Accepted {
        name: Name,
        announcement: PrefixAnnouncement,
    },
    /// A request failed validation and was dropped.
    Rejected { name: Name, reason: ValidationError },
    /// A validated request could not be acknowledged.
    Dropped { name: Name, reason: String },
    RegistrationLost,
}

struct Verdict {
    query: Query,
    result: Result<(), ValidationError>,
}

enum Wake {
    Query(Option<Query>),
    Verdict(Result<Verdict, JoinError>),
}

pub struct RendezvousAgent {
    options: Arc<RendezvousOptions>,
    face: Arc<dyn Face>,
    signer: Arc<dyn Signer>,
    validator: Arc<dyn Validator>,
    state: RendezvousState,
    registration: Option<PrefixRegistration>,
    validations: JoinSet<Verdict>,
    accepted: u64,
    rejected: u64,
    after_receive: Signal<Name>,
}

impl RendezvousAgent {
    pub fn new(
        options: Arc<RendezvousOptions>,
        face: Arc<dyn Face>,
        signer: Arc<dyn Signer>,
        validator: Arc<dyn Validator>,
    ) -> Self {
        Self {
            options,
            face,
            signer,
            validator,
            state: RendezvousState::Idle,
            registration: None,
            validations: JoinSet::new(),
            accepted: 0,
            rejected: 0,
            after_receive: Signal::new(),
        }
    }

    pub fn state(&self) -> RendezvousState {
        self.state
    }

    pub fn active_prefix(&self) -> &Name {
        self.options.active_prefix()
    }

    /// Requests accepted and rejected since construction.
    pub fn counters(&self) -> (u64, u64) {
        (self.accepted, self.rejected)
    }

    /// Listeners notified with each request name before it is validated.
    pub fn after_receive(&mut self) -> &mut Signal<Name> {
        &mut self.after_receive
    }

    pub async fn start(&mut self) -> Result<(), MobilityError> {
        if self.state == RendezvousState::Listening {
            return Ok(());
        }

        for standby in self.options.standby_prefixes() {
            warn!("Standby rendezvous prefix {standby} is inactive; only the first prefix is used");
        }

        let prefix = self.options.active_prefix().clone();
        let registration = self
            .face
            .register_prefix(&prefix)
            .await
            .map_err(MobilityError::Registration)?;

        self.registration = Some(registration);
        self.state = RendezvousState::Listening;
        info!("Rendezvous service listening on {prefix}");
        Ok(())
    }

    /// Withdraw the registration and abandon pending validations.
    pub fn stop(&mut self) {
        if let Some(registration) = self.registration.take() {
            self.face.unregister(registration.id());
        }
        self.validations.abort_all();
        self.validations.detach_all();
        if self.state == RendezvousState::Listening {
            info!("Rendezvous service on {} stopped", self.options.active_prefix());
        }
        self.state = RendezvousState::Idle;
    }

    /// Wait for and handle the next inbound request or validation verdict.
    ///
    /// Returns `None` when idle. Cancel safe.
    pub async fn step(&mut self) -> Option<RendezvousEvent> {
        if self.state == RendezvousState::Idle {
            return None;
        }

        let wake = tokio::select! {
            query = next_query(&mut self.registration) => Wake::Query(query),
            Some(done) = self.validations.join_next(), if !self.validations.is_empty() => Wake::Verdict(done),
        };

        let event = match wake {
            Wake::Query(Some(query)) => self.on_update_request(query),
            Wake::Query(None) => {
                error!(
                    "Registration for {} was withdrawn by the fabric",
                    self.options.active_prefix()
                );
                self.stop();
                RendezvousEvent::RegistrationLost
            }
            Wake::Verdict(Ok(verdict)) => self.on_verdict(verdict),
            Wake::Verdict(Err(e)) => {
                warn!("Validation task failed: {e}");
                RendezvousEvent::Dropped {
                    name: self.options.active_prefix().clone(),
                    reason: e.to_string(),
                }
            }
        };
        Some(event)
    }

    /// Drive the agent until `shutdown` resolves or the agent goes idle,
    /// then stop it.
    pub async fn run_until<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                event = self.step() => match event {
                    Some(event) => debug!("Rendezvous event: {event:?}"),
                    None => break,
                },
            }
        }
        self.stop();
    }

    fn on_update_request(&mut self, query: Query) -> RendezvousEvent {
        self.after_receive.emit(&query.name);
        debug!("Received update request {}", query.name);

        let name = query.name.clone();
        let validator = Arc::clone(&self.validator);
        self.validations.spawn(async move {
            let result = validator.validate(&query).await;
            Verdict { query, result }
        });
        RendezvousEvent::Received { name }
    }

    fn on_verdict(&mut self, verdict: Verdict) -> RendezvousEvent {
        match verdict.result {
            Ok(()) => self.on_accepted(verdict.query),
            Err(reason) => {
                self.rejected += 1;
                warn!("Rejected update request {}: {reason}", verdict.query.name);
                RendezvousEvent::Rejected {
                    name: verdict.query.name,
                    reason,
                }
            }
        }
    }

    fn on_accepted(&mut self, query: Query) -> RendezvousEvent {
        let name = query.name.clone();
        let request = match UpdateRequest::from_query(&query) {
            Ok(request) => request,
            Err(e) => return self.drop_request(name, e.to_string()),
        };
        let own = self.options.active_prefix();
        if request.rendezvous_prefix != *own {
            let e = CodecError::ForeignRendezvous {
                expected: own.clone(),
                actual: request.rendezvous_prefix,
            };
            return self.drop_request(name, e.to_string());
        }

        if request.requested_expiration.is_none_or(|d| d.is_zero()) {
            debug!("No expiration requested by {name}, granting the default");
        }
        let announcement = PrefixAnnouncement::for_request(&request);

        let mut response = match Acknowledgment::new(announcement.clone()).to_response(&query) {
            Ok(response) => response,
            Err(e) => return self.drop_request(name, e.to_string()),
        };
        if let Err(e) = response.sign(self.signer.as_ref(), self.options.active_prefix()) {
            return self.drop_request(name, e.to_string());
        }
        if let Err(e) = self.face.put(response) {
            return self.drop_request(name, e.to_string());
        }

        self.accepted += 1;
        info!(
            "Announced {} for {}ms",
            announcement.announced_name,
            announcement.expiration.as_millis()
        );
        RendezvousEvent::Accepted { name, announcement }
    }

    fn drop_request(&self, name: Name, reason: String) -> RendezvousEvent {
        warn!("Could not acknowledge {name}: {reason}");
        RendezvousEvent::Dropped { name, reason }
    }
}

async fn next_query(registration: &mut Option<PrefixRegistration>) -> Option<Query> {
    match registration {
        Some(registration) => registration.recv().await,
        None => pending().await,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::PrefixPair;
    use kite_network::security::verify_response;
    use kite_network::{KeyChain, MemoryFabric, NullValidator, Outcome, SignerConstraint, TrustPolicy};
    use std::sync::Mutex;
    use std::time::Duration;

    fn keychain() -> Arc<KeyChain> {
        let mut keys = KeyChain::new();
        keys.create_identity(&Name::parse("/rv"));
        keys.create_identity(&Name::parse("/rv/mobile-1"));
        Arc::new(keys)
    }

    fn update_query(keys: &KeyChain, expiration: Option<Duration>) -> Query {
        let pair = PrefixPair::new(Name::parse("/rv"), Name::parse("/mobile-1"));
        let request = UpdateRequest::new(&pair, expiration);
        let mut query = request.to_query(Duration::from_millis(1000)).unwrap();
        query.sign(keys, &request.producer_prefix()).unwrap();
        query
    }

    struct RejectAll;

    #[async_trait::async_trait]
    impl Validator for RejectAll {
        async fn validate(&self, _query: &Query) -> Result<(), ValidationError> {
            Err(ValidationError::BadSignature)
        }
    }

    fn agent(fabric: &MemoryFabric, keys: Arc<KeyChain>, validator: Arc<dyn Validator>) -> RendezvousAgent {
        RendezvousAgent::new(
            Arc::new(RendezvousOptions::new(Name::parse("/rv"))),
            Arc::new(fabric.face()),
            keys,
            validator,
        )
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let fabric = MemoryFabric::new();
        let mut rv = agent(&fabric, keychain(), Arc::new(NullValidator));
        rv.start().await.unwrap();
        assert_eq!(rv.state(), RendezvousState::Listening);
        assert_eq!(fabric.route_count(), 1);

        rv.stop();
        assert_eq!(rv.state(), RendezvousState::Idle);
        assert_eq!(fabric.route_count(), 0);
        assert!(rv.step().await.is_none());
    }

    #[tokio::test]
    async fn test_start_fails_when_prefix_taken() {
        let fabric = MemoryFabric::new();
        let squatter = fabric.face();
        let _reg = squatter.register_prefix(&Name::parse("/rv")).await.unwrap();

        let mut rv = agent(&fabric, keychain(), Arc::new(NullValidator));
        assert!(matches!(rv.start().await, Err(MobilityError::Registration(_))));
        assert_eq!(rv.state(), RendezvousState::Idle);
    }

    #[tokio::test]
    async fn test_accepted_request_is_acknowledged() {
        let fabric = MemoryFabric::new();
        let keys = keychain();
        let rv_key = keys.public_key(&Name::parse("/rv")).unwrap();
        let query = update_query(&keys, Some(Duration::from_millis(2500)));

        let mut rv = agent(&fabric, Arc::clone(&keys), Arc::new(NullValidator));
        rv.start().await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_by_listener = Arc::clone(&seen);
        rv.after_receive()
            .connect(move |name: &Name| seen_by_listener.lock().unwrap().push(name.clone()));

        let producer = fabric.face();
        let pending = tokio::spawn(async move { producer.express(query).await });

        assert_eq!(
            rv.step().await,
            Some(RendezvousEvent::Received {
                name: Name::parse("/rv/kite/mobile-1")
            })
        );
        assert_eq!(seen.lock().unwrap().len(), 1);

        let expected = PrefixAnnouncement::new(Name::parse("/rv/mobile-1"), Duration::from_millis(2500)).unwrap();
        assert_eq!(
            rv.step().await,
            Some(RendezvousEvent::Accepted {
                name: Name::parse("/rv/kite/mobile-1"),
                announcement: expected.clone(),
            })
        );
        assert_eq!(rv.counters(), (1, 0));

        match pending.await.unwrap().unwrap() {
            Outcome::Response { response } => {
                assert!(verify_response(&response, &rv_key));
                let ack = Acknowledgment::from_response(&response).unwrap();
                assert_eq!(ack.announcement, expected);
            }
            other => panic!("Expected acknowledgment, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_expiration_gets_default() {
        let fabric = MemoryFabric::new();
        let keys = keychain();
        let mut rv = agent(&fabric, Arc::clone(&keys), Arc::new(NullValidator));
        rv.start().await.unwrap();

        let event = rv.on_verdict(Verdict {
            query: update_query(&keys, None),
            result: Ok(()),
        });
        match event {
            RendezvousEvent::Accepted { announcement, .. } => {
                assert_eq!(announcement.expiration, Duration::from_millis(1000));
            }
            other => panic!("Expected acceptance, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_request_gets_no_answer() {
        let fabric = MemoryFabric::new();
        let keys = keychain();
        let query = update_query(&keys, None);

        let mut rv = agent(&fabric, keys, Arc::new(RejectAll));
        rv.start().await.unwrap();

        let producer = fabric.face();
        let pending = tokio::spawn(async move { producer.express(query).await });

        assert!(matches!(rv.step().await, Some(RendezvousEvent::Received { .. })));
        assert_eq!(
            rv.step().await,
            Some(RendezvousEvent::Rejected {
                name: Name::parse("/rv/kite/mobile-1"),
                reason: ValidationError::BadSignature,
            })
        );
        assert_eq!(rv.counters(), (0, 1));
        assert_eq!(pending.await.unwrap().unwrap(), Outcome::Timeout);
        assert_eq!(fabric.stats().responses_put, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_for_other_rendezvous_is_dropped() {
        let fabric = MemoryFabric::new();
        let signer = Name::parse("/rv/q/kite/y");
        let mut keys = KeyChain::new();
        keys.create_identity(&Name::parse("/rv"));
        keys.create_identity(&signer);
        let keys = Arc::new(keys);

        // The policy's split of /rv/kite/q/kite/y names the signer itself.
        let policy = TrustPolicy::new()
            .with_anchor(signer.clone(), keys.public_key(&signer).unwrap())
            .with_rule(
                Name::parse("/rv"),
                SignerConstraint::ClaimedName {
                    marker: "kite".to_string(),
                },
            );
        let pair = PrefixPair::new(Name::parse("/rv/kite/q"), Name::parse("/y"));
        let request = UpdateRequest::new(&pair, None);
        let mut query = request.to_query(Duration::from_millis(1000)).unwrap();
        query.sign(keys.as_ref(), &signer).unwrap();
        assert_eq!(policy.check(&query), Ok(()));

        let mut rv = agent(&fabric, Arc::clone(&keys), Arc::new(policy));
        rv.start().await.unwrap();

        let producer = fabric.face();
        let pending = tokio::spawn(async move { producer.express(query).await });

        assert!(matches!(rv.step().await, Some(RendezvousEvent::Received { .. })));
        match rv.step().await {
            Some(RendezvousEvent::Dropped { name, reason }) => {
                assert_eq!(name, Name::parse("/rv/kite/q/kite/y"));
                assert!(reason.contains("/rv/kite/q"), "unexpected reason: {reason}");
            }
            other => panic!("Expected drop, got {other:?}"),
        }
        assert_eq!(rv.counters(), (0, 0));
        assert_eq!(pending.await.unwrap().unwrap(), Outcome::Timeout);
        assert_eq!(fabric.stats().responses_put, 0);
    }

    #[tokio::test]
    async fn test_request_without_parameters_is_dropped() {
        let fabric = MemoryFabric::new();
        let mut rv = agent(&fabric, keychain(), Arc::new(NullValidator));
        rv.start().await.unwrap();

        let event = rv.on_verdict(Verdict {
            query: Query::new(Name::parse("/rv/kite/mobile-1")),
            result: Ok(()),
        });
        assert!(matches!(event, RendezvousEvent::Dropped { .. }));
        assert_eq!(fabric.stats().responses_put, 0);
    }
}
