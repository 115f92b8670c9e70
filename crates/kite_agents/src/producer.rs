//! Mobile producer agent.
//!
//! The producer registers `<rendezvous-prefix>/<producer-suffix>`, answers
//! every query it receives with a signed echo of the query, and keeps its
//! binding at the rendezvous point alive by sending signed update requests.
//!
//! The agent is driven by [`MobileProducerAgent::step`], which waits for the
//! next inbound query, update outcome or renewal deadline and handles it
//! before returning. All state lives on the task that drives it.

use std::future::{Future, pending};
use std::sync::Arc;

use kite_network::{Face, NackReason, Name, Outcome, PrefixRegistration, Query, Response, Signer};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::MobilityError;
use crate::messages::{Acknowledgment, PrefixAnnouncement, UpdateRequest};
use crate::options::ProducerOptions;
use crate::signal::Signal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerState {
    Idle,
    Registered,
    /// Registered, with one update request awaiting its outcome.
    RequestInFlight,
}

/// What a single [`MobileProducerAgent::step`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum ProducerEvent {
    /// A consumer query was answered with a signed echo.
    QueryAnswered { name: Name },
    /// A consumer query could not be answered.
    QueryDropped { name: Name, reason: String },
    /// A scheduled update request was sent.
    UpdateSent { name: Name },
    /// A scheduled update request could not be sent.
    UpdateNotSent { reason: String },
    /// The rendezvous point acknowledged the binding.
    Acknowledged { announcement: PrefixAnnouncement },
    Nacked { reason: NackReason },
    TimedOut { name: Name },
    /// The update resolved but produced no usable acknowledgment.
    UpdateFailed { reason: String },
    /// The fabric withdrew the producer's registration.
    RegistrationLost,
}

/// The current binding, as last acknowledged.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub announcement: PrefixAnnouncement,
    pub acknowledged_at: Instant,
}

impl Binding {
    pub fn expires_at(&self) -> Instant {
        self.acknowledged_at + self.announcement.expiration
    }

    pub fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at()
    }
}

struct UpdateAttempt {
    name: Name,
    request: UpdateRequest,
    result: Result<Outcome, kite_network::NetworkError>,
}

enum Wake {
    Query(Option<Query>),
    Attempt(Result<UpdateAttempt, JoinError>),
    RenewalDue,
}

pub struct MobileProducerAgent {
    options: Arc<ProducerOptions>,
    face: Arc<dyn Face>,
    signer: Arc<dyn Signer>,
    state: ProducerState,
    registration: Option<PrefixRegistration>,
    in_flight: JoinSet<UpdateAttempt>,
    next_update: Option<Instant>,
    failed_attempts: u32,
    binding: Option<Binding>,
    after_receive: Signal<Name>,
}

impl MobileProducerAgent {
    pub fn new(options: Arc<ProducerOptions>, face: Arc<dyn Face>, signer: Arc<dyn Signer>) -> Self {
        Self {
            options,
            face,
            signer,
            state: ProducerState::Idle,
            registration: None,
            in_flight: JoinSet::new(),
            next_update: None,
            failed_attempts: 0,
            binding: None,
            after_receive: Signal::new(),
        }
    }

    pub fn state(&self) -> ProducerState {
        self.state
    }

    pub fn options(&self) -> &ProducerOptions {
        &self.options
    }

    pub fn producer_prefix(&self) -> Name {
        self.options.producer_prefix()
    }

    /// The last acknowledged binding, if any.
    pub fn binding(&self) -> Option<&Binding> {
        self.binding.as_ref()
    }

    /// When the next automatic update request is due.
    pub fn next_update_at(&self) -> Option<Instant> {
        self.next_update
    }

    /// Consecutive failed automatic updates since the last acknowledgment.
    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    /// Listeners notified with the query name before each echo is built.
    pub fn after_receive(&mut self) -> &mut Signal<Name> {
        &mut self.after_receive
    }

    /// Register the producer prefix with the fabric.
    ///
    /// With auto-renew enabled the first update request goes out on the next
    /// [`step`](Self::step). Starting a running agent is a no-op.
    pub async fn start(&mut self) -> Result<(), MobilityError> {
        if self.state != ProducerState::Idle {
            return Ok(());
        }
        self.options.validate()?;

        for standby in self.options.standby_pairs() {
            warn!(
                "Standby prefix pair {} is inactive; only the first pair is used",
                standby.producer_prefix()
            );
        }

        let prefix = self.options.producer_prefix();
        let registration = self
            .face
            .register_prefix(&prefix)
            .await
            .map_err(MobilityError::Registration)?;

        self.registration = Some(registration);
        self.state = ProducerState::Registered;
        self.failed_attempts = 0;
        if self.options.auto_renew() {
            self.next_update = Some(Instant::now());
        }
        info!("Mobile producer registered {prefix}");
        Ok(())
    }

    /// Withdraw the registration and cancel any outstanding update.
    ///
    /// Nothing the agent scheduled runs after this returns.
    pub fn stop(&mut self) {
        if let Some(registration) = self.registration.take() {
            self.face.unregister(registration.id());
        }
        self.in_flight.abort_all();
        self.in_flight.detach_all();
        self.next_update = None;
        self.failed_attempts = 0;
        if self.state != ProducerState::Idle {
            info!("Mobile producer {} stopped", self.options.producer_prefix());
        }
        self.state = ProducerState::Idle;
    }

    /// Sign and send one update request for the active prefix pair.
    ///
    /// The outcome is handled by a later [`step`](Self::step).
    pub fn send_update_request(&mut self) -> Result<Name, MobilityError> {
        match self.state {
            ProducerState::Idle => return Err(MobilityError::NotStarted),
            ProducerState::RequestInFlight => return Err(MobilityError::UpdateInFlight),
            ProducerState::Registered => {}
        }

        let lifetime = self.options.request_lifetime();
        let request = UpdateRequest::new(self.options.active_pair(), Some(lifetime));
        let mut query = request.to_query(lifetime)?;
        query.sign(self.signer.as_ref(), &request.producer_prefix())?;

        let name = query.name.clone();
        debug!("Sending update request {name}");

        let face = Arc::clone(&self.face);
        let attempt_name = name.clone();
        self.in_flight.spawn(async move {
            let result = face.express(query).await;
            UpdateAttempt {
                name: attempt_name,
                request,
                result,
            }
        });
        self.state = ProducerState::RequestInFlight;
        Ok(name)
    }

    /// Wait for and handle the next thing that happens to this agent.
    ///
    /// Returns `None` when the agent is idle. Cancel safe: dropping the
    /// future before it completes loses nothing.
    pub async fn step(&mut self) -> Option<ProducerEvent> {
        if self.state == ProducerState::Idle {
            return None;
        }

        let deadline = self.next_update;
        let wake = tokio::select! {
            query = next_query(&mut self.registration) => Wake::Query(query),
            Some(done) = self.in_flight.join_next(), if !self.in_flight.is_empty() => Wake::Attempt(done),
            _ = sleep_until(deadline), if deadline.is_some() => Wake::RenewalDue,
        };

        let event = match wake {
            Wake::Query(Some(query)) => self.on_query(query),
            Wake::Query(None) => {
                error!(
                    "Registration for {} was withdrawn by the fabric",
                    self.options.producer_prefix()
                );
                self.stop();
                ProducerEvent::RegistrationLost
            }
            Wake::Attempt(Ok(attempt)) => self.on_attempt(attempt),
            Wake::Attempt(Err(e)) => {
                self.state = ProducerState::Registered;
                self.on_update_failure(format!("update task failed: {e}"))
            }
            Wake::RenewalDue => self.on_renewal_due(),
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
                    Some(event) => debug!("Producer event: {event:?}"),
                    None => break,
                },
            }
        }
        self.stop();
    }

    fn on_query(&mut self, query: Query) -> ProducerEvent {
        self.after_receive.emit(&query.name);
        debug!("Received query {}", query.name);

        let name = query.name.clone();
        let content = match query.wire_encode() {
            Ok(content) => content,
            Err(e) => return self.drop_query(name, format!("encode failed: {e}")),
        };

        let mut response = Response::new(name.clone(), content);
        if let Err(e) = response.sign(self.signer.as_ref(), &self.options.producer_prefix()) {
            return self.drop_query(name, e.to_string());
        }
        if let Err(e) = self.face.put(response) {
            return self.drop_query(name, e.to_string());
        }
        ProducerEvent::QueryAnswered { name }
    }

    fn drop_query(&self, name: Name, reason: String) -> ProducerEvent {
        warn!("Could not answer {name}: {reason}");
        ProducerEvent::QueryDropped { name, reason }
    }

    fn on_renewal_due(&mut self) -> ProducerEvent {
        self.next_update = None;
        match self.send_update_request() {
            Ok(name) => ProducerEvent::UpdateSent { name },
            Err(MobilityError::UpdateInFlight) => {
                // Rescheduled once the outstanding request resolves.
                ProducerEvent::UpdateNotSent {
                    reason: MobilityError::UpdateInFlight.to_string(),
                }
            }
            Err(e) => {
                warn!("Could not send update request: {e}");
                self.schedule_after_failure();
                ProducerEvent::UpdateNotSent {
                    reason: e.to_string(),
                }
            }
        }
    }

    fn on_attempt(&mut self, attempt: UpdateAttempt) -> ProducerEvent {
        self.state = ProducerState::Registered;
        match attempt.result {
            Ok(Outcome::Response { response }) => self.on_acknowledgment(&attempt.request, &response),
            Ok(Outcome::Nack { reason }) => {
                warn!("Update request {} nacked: {reason}", attempt.name);
                self.schedule_after_failure();
                ProducerEvent::Nacked { reason }
            }
            Ok(Outcome::Timeout) => {
                warn!("Update request {} timed out", attempt.name);
                self.schedule_after_failure();
                ProducerEvent::TimedOut { name: attempt.name }
            }
            Err(e) => self.on_update_failure(e.to_string()),
        }
    }

    fn on_acknowledgment(&mut self, request: &UpdateRequest, response: &Response) -> ProducerEvent {
        let ack = match Acknowledgment::from_response(response) {
            Ok(ack) => ack,
            Err(e) => return self.on_update_failure(format!("bad acknowledgment: {e}")),
        };

        let announcement = ack.announcement;
        if announcement.announced_name != request.producer_prefix() {
            return self.on_update_failure(format!(
                "acknowledgment announces {} instead of {}",
                announcement.announced_name,
                request.producer_prefix()
            ));
        }
        info!(
            "Rendezvous acknowledged {} for {}ms",
            announcement.announced_name,
            announcement.expiration.as_millis()
        );

        self.binding = Some(Binding {
            announcement: announcement.clone(),
            acknowledged_at: Instant::now(),
        });
        self.failed_attempts = 0;
        if self.options.auto_renew() {
            self.next_update = Some(Instant::now() + self.options.update_interval());
        }
        ProducerEvent::Acknowledged { announcement }
    }

    fn on_update_failure(&mut self, reason: String) -> ProducerEvent {
        warn!("Update request failed: {reason}");
        self.schedule_after_failure();
        ProducerEvent::UpdateFailed { reason }
    }

    /// Back off after a failed automatic update, falling back to the regular
    /// interval once retries are exhausted.
    fn schedule_after_failure(&mut self) {
        if !self.options.auto_renew() || self.state == ProducerState::Idle {
            return;
        }
        self.failed_attempts += 1;
        let delay = match self.options.retry().backoff(self.failed_attempts) {
            Some(backoff) => {
                debug!("Retrying update in {}ms (attempt {})", backoff.as_millis(), self.failed_attempts);
                backoff
            }
            None => {
                self.failed_attempts = 0;
                self.options.update_interval()
            }
        };
        self.next_update = Some(Instant::now() + delay);
    }
}

async fn next_query(registration: &mut Option<PrefixRegistration>) -> Option<Query> {
    match registration {
        Some(registration) => registration.recv().await,
        None => pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => pending().await,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
