//! Perfect negotiation.
//!
//! Turns possibly-colliding offer/answer exchanges between two endpoints into
//! a single stable session. Each side derives its role once: the side whose
//! serialized endpoint sorts first is *polite*. On a collision (both sides
//! offered at once) the polite side rolls back its own offer and answers;
//! the impolite side ignores the incoming offer and every candidate that
//! belongs to it.
//!
//! The [`Negotiator`] does no I/O. Feed it [`NegotiationInput`]s; it returns
//! the [`NegotiationAction`]s the caller must perform, and the caller reports
//! each outcome back as another input. While an action is outstanding the
//! negotiator sits in an explicit [`Phase`].

use crate::Endpoint;
use crate::protocol::{IceCandidate, SdpType, SessionDescription};
use crate::transport::TransportState;
use tracing::{debug, info, warn};

/// `true` if `local` is the polite side towards `remote`.
pub fn is_polite(local: &Endpoint, remote: &Endpoint) -> bool {
    local.to_string() < remote.to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

/// What the negotiator is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    /// A local offer is being created; `generation` identifies it
    AwaitingLocalOffer { generation: u64 },
    /// A remote description is being applied
    AwaitingRemoteDescription { kind: SdpType },
    /// A local answer is being created
    AwaitingLocalAnswer,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NegotiationInput {
    /// Local state changed and needs a (re)negotiation
    NegotiationNeeded,
    LocalOfferCreated {
        generation: u64,
        description: SessionDescription,
    },
    LocalOfferFailed {
        generation: u64,
        reason: String,
    },
    RemoteDescription(SessionDescription),
    RemoteDescriptionApplied,
    RemoteDescriptionFailed(String),
    LocalAnswerCreated(SessionDescription),
    LocalAnswerFailed(String),
    RemoteCandidate(IceCandidate),
    CandidateFailed(String),
    TransportState(TransportState),
    Close,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NegotiationAction {
    /// Create and install a local offer, then report `LocalOfferCreated`
    CreateOffer { generation: u64, ice_restart: bool },
    /// Apply a remote description, then report `RemoteDescriptionApplied`
    ApplyRemoteDescription(SessionDescription),
    /// Create and install a local answer, then report `LocalAnswerCreated`
    CreateAnswer,
    AddCandidate(IceCandidate),
    /// Send a description to the remote through signaling
    SendDescription(SessionDescription),
}

/// Negotiation state for one remote endpoint.
#[derive(Debug)]
pub struct Negotiator {
    polite: bool,
    signaling: SignalingState,
    phase: Phase,
    making_offer: bool,
    setting_remote_answer_pending: bool,
    offer_ignored: bool,
    /// Negotiation was requested while busy
    renegotiate: bool,
    /// Next offer should restart ICE
    ice_restart: bool,
    generation: u64,
}

impl Negotiator {
    pub fn new(polite: bool) -> Self {
        Self {
            polite,
            signaling: SignalingState::Stable,
            phase: Phase::Idle,
            making_offer: false,
            setting_remote_answer_pending: false,
            offer_ignored: false,
            renegotiate: false,
            ice_restart: false,
            generation: 0,
        }
    }

    pub fn for_endpoints(local: &Endpoint, remote: &Endpoint) -> Self {
        Self::new(is_polite(local, remote))
    }

    pub fn is_polite(&self) -> bool {
        self.polite
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.signaling
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_making_offer(&self) -> bool {
        self.making_offer
    }

    pub fn is_setting_remote_answer_pending(&self) -> bool {
        self.setting_remote_answer_pending
    }

    pub fn is_offer_ignored(&self) -> bool {
        self.offer_ignored
    }

    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    /// Apply one input and return what the caller must do next, in order.
    pub fn handle(&mut self, input: NegotiationInput) -> Vec<NegotiationAction> {
        if self.is_closed() {
            debug!(?input, "Negotiator closed, ignoring input");
            return Vec::new();
        }

        let mut actions = Vec::new();
        match input {
            NegotiationInput::NegotiationNeeded => self.start_offer(&mut actions),
            NegotiationInput::LocalOfferCreated {
                generation,
                description,
            } => {
                if !self.making_offer || generation != self.generation {
                    debug!(generation, current = self.generation, "Discarding stale local offer");
                    return actions;
                }
                self.making_offer = false;
                self.signaling = SignalingState::HaveLocalOffer;
                self.phase = Phase::Idle;
                actions.push(NegotiationAction::SendDescription(description));
            }
            NegotiationInput::LocalOfferFailed { generation, reason } => {
                if generation == self.generation && self.making_offer {
                    warn!(%reason, "Failed to create offer");
                    self.making_offer = false;
                    self.phase = Phase::Idle;
                }
            }
            NegotiationInput::RemoteDescription(description) => {
                self.on_remote_description(description, &mut actions)
            }
            NegotiationInput::RemoteDescriptionApplied => {
                let Phase::AwaitingRemoteDescription { kind } = self.phase else {
                    warn!(phase = ?self.phase, "Remote description applied in unexpected phase");
                    return actions;
                };
                self.setting_remote_answer_pending = false;
                match kind {
                    SdpType::Offer => {
                        self.signaling = SignalingState::HaveRemoteOffer;
                        self.phase = Phase::AwaitingLocalAnswer;
                        actions.push(NegotiationAction::CreateAnswer);
                    }
                    SdpType::Answer => {
                        self.signaling = SignalingState::Stable;
                        self.phase = Phase::Idle;
                        self.resume(&mut actions);
                    }
                }
            }
            NegotiationInput::RemoteDescriptionFailed(reason) => {
                warn!(%reason, "Failed to apply remote description");
                if self.phase
                    == (Phase::AwaitingRemoteDescription {
                        kind: SdpType::Answer,
                    })
                {
                    // Our offer went unanswered; offer again
                    self.renegotiate = true;
                }
                self.setting_remote_answer_pending = false;
                self.signaling = SignalingState::Stable;
                self.phase = Phase::Idle;
                self.resume(&mut actions);
            }
            NegotiationInput::LocalAnswerCreated(description) => {
                if self.phase != Phase::AwaitingLocalAnswer {
                    warn!(phase = ?self.phase, "Local answer created in unexpected phase");
                    return actions;
                }
                self.signaling = SignalingState::Stable;
                self.phase = Phase::Idle;
                actions.push(NegotiationAction::SendDescription(description));
                self.resume(&mut actions);
            }
            NegotiationInput::LocalAnswerFailed(reason) => {
                warn!(%reason, "Failed to create answer");
                self.signaling = SignalingState::Stable;
                self.phase = Phase::Idle;
                self.resume(&mut actions);
            }
            NegotiationInput::RemoteCandidate(candidate) => {
                if self.offer_ignored {
                    debug!("Dropping candidate for an ignored offer");
                } else {
                    actions.push(NegotiationAction::AddCandidate(candidate));
                }
            }
            NegotiationInput::CandidateFailed(reason) => {
                if !self.offer_ignored {
                    warn!(%reason, "Failed to add ICE candidate");
                }
            }
            NegotiationInput::TransportState(TransportState::Failed) => {
                info!("Transport failed, restarting ICE");
                self.ice_restart = true;
                self.start_offer(&mut actions);
            }
            NegotiationInput::TransportState(TransportState::Closed) | NegotiationInput::Close => {
                self.phase = Phase::Closed;
                self.making_offer = false;
            }
            NegotiationInput::TransportState(state) => {
                debug!(?state, "Transport state changed");
            }
        }
        actions
    }

    fn start_offer(&mut self, actions: &mut Vec<NegotiationAction>) {
        if self.making_offer || self.phase != Phase::Idle || self.signaling != SignalingState::Stable {
            // One offer in flight at a time; pick this up once stable
            self.renegotiate = true;
            return;
        }
        self.renegotiate = false;
        self.making_offer = true;
        self.generation += 1;
        self.phase = Phase::AwaitingLocalOffer {
            generation: self.generation,
        };
        actions.push(NegotiationAction::CreateOffer {
            generation: self.generation,
            ice_restart: std::mem::take(&mut self.ice_restart),
        });
    }

    fn resume(&mut self, actions: &mut Vec<NegotiationAction>) {
        if self.renegotiate {
            self.start_offer(actions);
        }
    }

    fn on_remote_description(
        &mut self,
        description: SessionDescription,
        actions: &mut Vec<NegotiationAction>,
    ) {
        let ready_for_offer = !self.making_offer
            && (self.signaling == SignalingState::Stable || self.setting_remote_answer_pending);
        let collision = description.is_offer() && !ready_for_offer;

        self.offer_ignored = !self.polite && collision;
        if self.offer_ignored {
            info!("Offer collision, ignoring remote offer");
            return;
        }

        if collision {
            info!("Offer collision, rolling back local offer");
            // Invalidate any offer still being created
            self.making_offer = false;
            self.generation += 1;
            self.signaling = SignalingState::Stable;
        }

        self.setting_remote_answer_pending = description.kind == SdpType::Answer;
        self.phase = Phase::AwaitingRemoteDescription {
            kind: description.kind,
        };
        actions.push(NegotiationAction::ApplyRemoteDescription(description));
    }
}
