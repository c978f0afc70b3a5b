use rand::seq::SliceRandom;
use rand::Rng;

use crate::{MatchError, Participant, ParticipantId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrawOutcome {
    Assigned(ParticipantId),
    AlreadyAssigned(ParticipantId),
}

impl DrawOutcome {
    pub fn recipient(&self) -> &ParticipantId {
        match self {
            DrawOutcome::Assigned(id) | DrawOutcome::AlreadyAssigned(id) => id,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, DrawOutcome::Assigned(_))
    }
}

pub(crate) fn admits(giver: &Participant, giver_family: &str, candidate: &Participant, claimed: bool) -> bool {
    candidate.id != giver.id
        && !claimed
        && candidate
            .family()
            .is_some_and(|family| family != giver_family)
}

pub(crate) fn family_of(giver: &Participant) -> Result<&str, MatchError> {
    giver.family().ok_or_else(|| MatchError::MissingFamily {
        participant: giver.id.clone(),
    })
}

pub fn eligible_recipients<'a>(
    participants: &'a [Participant],
    giver: &Participant,
) -> Result<Vec<&'a Participant>, MatchError> {
    let family = family_of(giver)?;
    Ok(participants
        .iter()
        .filter(|candidate| admits(giver, family, candidate, candidate.claimed))
        .collect())
}

pub fn draw<R: Rng + ?Sized>(
    participants: &mut [Participant],
    giver_id: &str,
    rng: &mut R,
) -> Result<DrawOutcome, MatchError> {
    let giver_index = participants
        .iter()
        .position(|p| p.id == giver_id)
        .ok_or_else(|| MatchError::UnknownParticipant(giver_id.to_string()))?;
    let giver = &participants[giver_index];
    family_of(giver)?;
    if let Some(existing) = &giver.assigned_to {
        return Ok(DrawOutcome::AlreadyAssigned(existing.clone()));
    }

    let recipient_index = {
        let pool = eligible_recipients(participants, giver)?;
        let chosen = pool.choose(rng).ok_or_else(|| MatchError::NoEligibleRecipient {
            giver: giver_id.to_string(),
        })?;
        participants
            .iter()
            .position(|p| p.id == chosen.id)
            .ok_or_else(|| MatchError::UnknownParticipant(chosen.id.clone()))?
    };

    let recipient_id = participants[recipient_index].id.clone();
    participants[recipient_index].claimed = true;
    participants[giver_index].assigned_to = Some(recipient_id.clone());
    Ok(DrawOutcome::Assigned(recipient_id))
}
