use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;

pub mod draw;
pub mod roster;
pub mod search;

pub use draw::{draw, eligible_recipients, DrawOutcome};
pub use roster::Roster;
pub use search::{solve, SearchOptions, SearchStats, Solution};

pub type ParticipantId = String;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Participant {
    pub id: ParticipantId,
    pub name: String,
    pub family: Option<String>,
    #[serde(default)]
    pub assigned_to: Option<ParticipantId>,
    #[serde(default)]
    pub claimed: bool,
}

impl Participant {
    /// Builds an unassigned participant. Blank family labels are stored as unset.
    pub fn new(id: impl Into<ParticipantId>, name: impl Into<String>, family: impl Into<String>) -> Self {
        let family = family.into().trim().to_string();
        Self {
            id: id.into(),
            name: name.into().trim().to_string(),
            family: (!family.is_empty()).then_some(family),
            assigned_to: None,
            claimed: false,
        }
    }

    /// The trimmed family label, or `None` when unset or blank.
    pub fn family(&self) -> Option<&str> {
        self.family
            .as_deref()
            .map(str::trim)
            .filter(|family| !family.is_empty())
    }

    pub fn shares_family_with(&self, other: &Participant) -> bool {
        match (self.family(), other.family()) {
            (Some(mine), Some(theirs)) => mine == theirs,
            _ => false,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.assigned_to = None;
        self.claimed = false;
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MatchError {
    #[error("at least two participants are required, found {count}")]
    InsufficientParticipants { count: usize },
    #[error("participant {participant} has no family")]
    MissingFamily { participant: ParticipantId },
    #[error("no eligible recipient left for {giver}")]
    NoEligibleRecipient { giver: ParticipantId },
    #[error("no valid exchange exists for {participants} participants with this family distribution")]
    Infeasible { participants: usize },
    #[error("search abandoned after {steps} steps")]
    StepBudgetExceeded { steps: u64 },
    #[error("participant not found: {0}")]
    UnknownParticipant(ParticipantId),
    #[error("participant already exists: {0}")]
    DuplicateParticipant(String),
    #[error("invalid assignment: {0}")]
    InvalidAssignment(#[from] AssignmentViolation),
    #[error("poisoned lock: {0}")]
    LockPoisoned(&'static str),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AssignmentViolation {
    #[error("{0} gives to nobody")]
    MissingGiver(ParticipantId),
    #[error("{0} receives from nobody")]
    MissingRecipient(ParticipantId),
    #[error("{0} is not part of the exchange")]
    Unknown(ParticipantId),
    #[error("{0} gives to themselves")]
    SelfAssignment(ParticipantId),
    #[error("{giver} gives to {recipient} from the same family")]
    SameFamily {
        giver: ParticipantId,
        recipient: ParticipantId,
    },
    #[error("{0} receives more than one gift")]
    DuplicateRecipient(ParticipantId),
}

/// A complete giver -> recipient mapping produced by a global run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Assignment {
    pairs: BTreeMap<ParticipantId, ParticipantId>,
}

impl Assignment {
    pub fn recipient_of(&self, giver: &str) -> Option<&ParticipantId> {
        self.pairs.get(giver)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ParticipantId, &ParticipantId)> {
        self.pairs.iter()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub(crate) fn insert(&mut self, giver: ParticipantId, recipient: ParticipantId) {
        self.pairs.insert(giver, recipient);
    }

    /// Checks that the mapping is a bijection over `participants` with no
    /// self or same-family pairs.
    pub fn verify(&self, participants: &[Participant]) -> Result<(), AssignmentViolation> {
        let by_id: HashMap<&str, &Participant> =
            participants.iter().map(|p| (p.id.as_str(), p)).collect();
        let mut received: HashSet<&str> = HashSet::with_capacity(self.pairs.len());

        for (giver_id, recipient_id) in &self.pairs {
            let giver = by_id
                .get(giver_id.as_str())
                .ok_or_else(|| AssignmentViolation::Unknown(giver_id.clone()))?;
            let recipient = by_id
                .get(recipient_id.as_str())
                .ok_or_else(|| AssignmentViolation::Unknown(recipient_id.clone()))?;
            if giver_id == recipient_id {
                return Err(AssignmentViolation::SelfAssignment(giver_id.clone()));
            }
            if giver.shares_family_with(recipient) {
                return Err(AssignmentViolation::SameFamily {
                    giver: giver_id.clone(),
                    recipient: recipient_id.clone(),
                });
            }
            if !received.insert(recipient_id.as_str()) {
                return Err(AssignmentViolation::DuplicateRecipient(recipient_id.clone()));
            }
        }

        for participant in participants {
            if !self.pairs.contains_key(&participant.id) {
                return Err(AssignmentViolation::MissingGiver(participant.id.clone()));
            }
            if !received.contains(participant.id.as_str()) {
                return Err(AssignmentViolation::MissingRecipient(participant.id.clone()));
            }
        }
        Ok(())
    }
}
