#[cfg(test)]
mod description_test;

use std::fmt;
use std::net::SocketAddr;

use crate::candidate::*;
use crate::error::*;
use crate::rand::{generate_pwd, generate_ufrag};

pub(crate) const MAX_CANDIDATES_COUNT: usize = 24;
pub(crate) const MAX_HOST_CANDIDATES_COUNT: usize = 8;
pub(crate) const MAX_PEER_REFLEXIVE_CANDIDATES_COUNT: usize = 4;

/// Credentials plus the ordered candidate list of one side of the session.
///
/// Candidates are append-only so `CandidateId` indices handed out earlier
/// stay valid for the lifetime of the agent.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Description {
    pub ufrag: String,
    pub pwd: String,
    pub candidates: Vec<Candidate>,
    /// End-of-candidates: no further candidates will be added.
    pub finished: bool,
}

pub type LocalDescription = Description;
pub type RemoteDescription = Description;

impl Description {
    /// Creates a local description with fresh credentials.
    pub fn new_local() -> Self {
        Self {
            ufrag: generate_ufrag(),
            pwd: generate_pwd(),
            candidates: vec![],
            finished: false,
        }
    }

    pub fn candidate(&self, id: CandidateId) -> &Candidate {
        &self.candidates[id]
    }

    pub fn count_of(&self, kind: CandidateType) -> usize {
        self.candidates.iter().filter(|c| c.kind == kind).count()
    }

    /// Appends a candidate, enforcing the per-kind and total caps.
    pub fn add_candidate(&mut self, candidate: Candidate) -> Result<CandidateId> {
        if self.candidates.len() >= MAX_CANDIDATES_COUNT {
            return Err(Error::ErrTooManyCandidates);
        }
        match candidate.kind {
            CandidateType::Host if self.count_of(CandidateType::Host) >= MAX_HOST_CANDIDATES_COUNT => {
                return Err(Error::ErrTooManyCandidates);
            }
            CandidateType::PeerReflexive
                if self.count_of(CandidateType::PeerReflexive)
                    >= MAX_PEER_REFLEXIVE_CANDIDATES_COUNT =>
            {
                return Err(Error::ErrTooManyCandidates);
            }
            _ => {}
        }

        self.candidates.push(candidate);
        Ok(self.candidates.len() - 1)
    }

    /// Looks a candidate up by transport address, optionally constrained to
    /// a type. `CandidateType::Unspecified` matches any type.
    pub fn find_candidate_from_addr(
        &self,
        addr: &SocketAddr,
        kind: CandidateType,
    ) -> Option<CandidateId> {
        self.candidates.iter().position(|c| {
            c.resolved == *addr && (kind == CandidateType::Unspecified || c.kind == kind)
        })
    }
}

impl fmt::Display for Description {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "a=ice-ufrag:{}", self.ufrag)?;
        writeln!(f, "a=ice-pwd:{}", self.pwd)?;
        for c in &self.candidates {
            writeln!(f, "a=candidate:{}", c.marshal())?;
        }
        if self.finished {
            writeln!(f, "a=end-of-candidates")?;
        }
        Ok(())
    }
}

/// Parses the candidate-level description shape produced by `Display`.
/// Unknown lines are ignored so a full SDP blob can be passed through.
pub fn parse_description(raw: &str) -> Result<Description> {
    let mut description = Description::default();

    for line in raw.lines() {
        let line = line.trim().trim_start_matches("a=");
        if let Some(ufrag) = line.strip_prefix("ice-ufrag:") {
            description.ufrag = ufrag.to_owned();
        } else if let Some(pwd) = line.strip_prefix("ice-pwd:") {
            description.pwd = pwd.to_owned();
        } else if line.starts_with("candidate:") {
            description.candidates.push(unmarshal_candidate(line)?);
        } else if line == "end-of-candidates" {
            description.finished = true;
        }
    }

    if description.ufrag.is_empty() && description.pwd.is_empty() && description.candidates.is_empty()
    {
        return Err(Error::ErrParseDescription);
    }

    Ok(description)
}
