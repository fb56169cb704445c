//! Wait policy
//!
//! Decides how long a pending turn keeps waiting for more events. The
//! window is recomputed from the turn's whole content on every create and
//! merge, and never extends past `hard_ceiling` from when the turn opened.

use std::time::Duration;

use regex::{Regex, RegexBuilder};
use serde::Serialize;
use tokio::time::Instant;

use super::PendingTurn;
use crate::config::TurnConfig;
use crate::{Error, Result};

/// Why a wait was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitReason {
    /// Plain text
    Short,
    /// Attachment with no text yet
    AttachmentFirst,
    /// Text names an attachment that has not arrived
    ReferenceKeyword,
    /// Short question, likely about something about to be sent
    ShortQuestion,
    /// Text and attachment both present
    Combo,
    /// Smart delay switched off
    Disabled,
}

/// Chosen wait and the rule that chose it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitDecision {
    pub wait: Duration,
    pub reason: WaitReason,
}

/// Detects text that points at an attachment
#[derive(Debug, Clone)]
pub struct ReferenceDetector {
    phrases: Option<Regex>,
    short_question_max_words: usize,
}

impl ReferenceDetector {
    /// Build from configured phrases (matched case-insensitively, anywhere
    /// in the text)
    ///
    /// # Errors
    ///
    /// Returns error if the combined pattern cannot be compiled
    pub fn new(phrases: &[String], short_question_max_words: usize) -> Result<Self> {
        let alternatives: Vec<String> = phrases
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .map(regex::escape)
            .collect();

        let phrases = if alternatives.is_empty() {
            None
        } else {
            Some(
                RegexBuilder::new(&alternatives.join("|"))
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| Error::Config(format!("invalid reference phrases: {e}")))?,
            )
        };

        Ok(Self {
            phrases,
            short_question_max_words,
        })
    }

    #[must_use]
    pub fn matches_phrase(&self, text: &str) -> bool {
        self.phrases.as_ref().is_some_and(|re| re.is_match(text))
    }

    /// A question mark in a message of at most `short_question_max_words`
    #[must_use]
    pub fn is_short_question(&self, text: &str) -> bool {
        self.short_question_max_words > 0
            && text.contains(['?', '？'])
            && text.split_whitespace().count() <= self.short_question_max_words
    }

    #[must_use]
    pub fn references_attachment(&self, text: &str) -> bool {
        self.matches_phrase(text) || self.is_short_question(text)
    }
}

/// Turn wait policy
#[derive(Debug, Clone)]
pub struct WaitPolicy {
    config: TurnConfig,
    detector: ReferenceDetector,
}

impl WaitPolicy {
    /// Build a policy from validated tunables
    ///
    /// # Errors
    ///
    /// Returns error if the tunables are inconsistent or the reference
    /// phrases do not compile
    pub fn new(config: &TurnConfig) -> Result<Self> {
        config.validate()?;
        let detector =
            ReferenceDetector::new(&config.reference_phrases, config.short_question_max_words)?;

        Ok(Self {
            config: config.clone(),
            detector,
        })
    }

    #[must_use]
    pub const fn detector(&self) -> &ReferenceDetector {
        &self.detector
    }

    #[must_use]
    pub const fn hard_ceiling(&self) -> Duration {
        self.config.hard_ceiling
    }

    /// Pick the wait for a turn's current content
    #[must_use]
    pub fn decide(&self, turn: &PendingTurn) -> WaitDecision {
        let c = &self.config;

        if !c.smart_delay_enabled {
            return WaitDecision {
                wait: c.short_wait,
                reason: WaitReason::Disabled,
            };
        }

        let has_text = turn.has_text();
        let has_media = turn.has_media();

        if has_text && has_media {
            let mut wait = c.combo_wait.max(c.attachment_first_wait);
            if self.detector.references_attachment(&turn.combined_text()) {
                wait = wait.max(c.reference_keyword_wait);
            }
            return WaitDecision {
                wait,
                reason: WaitReason::Combo,
            };
        }

        if has_media {
            return WaitDecision {
                wait: c.attachment_first_wait,
                reason: WaitReason::AttachmentFirst,
            };
        }

        let text = turn.combined_text();
        if self.detector.matches_phrase(&text) {
            WaitDecision {
                wait: c.reference_keyword_wait,
                reason: WaitReason::ReferenceKeyword,
            }
        } else if self.detector.is_short_question(&text) {
            WaitDecision {
                wait: c.reference_keyword_wait,
                reason: WaitReason::ShortQuestion,
            }
        } else {
            WaitDecision {
                wait: c.short_wait,
                reason: WaitReason::Short,
            }
        }
    }

    /// Deadline for a turn as of `now`, capped by the hard ceiling
    #[must_use]
    pub fn deadline(&self, turn: &PendingTurn, now: Instant) -> (Instant, WaitDecision) {
        let decision = self.decide(turn);
        let ceiling = turn.opened_at + self.config.hard_ceiling;
        ((now + decision.wait).min(ceiling), decision)
    }
}
