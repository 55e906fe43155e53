//! Per-skill endorsement statistics.
//!
//! Average ratings are fixed-point, scaled by [`RATING_SCALE`]: the stored
//! value is `sum * 100 / count` with integer division, so ratings 10, 7 and 4
//! average to `700` (7.00). Ratings 10 and 9 average to `950`.

use serde::{Deserialize, Serialize};

use crate::ledger::EndorsementLedger;

pub const RATING_SCALE: u64 = 100;

/// Index-aligned summary over every endorsed skill.
///
/// `skills`, `average_ratings` and `counts` always have length
/// `total_skills`, ordered by first endorsement.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndorsementSummary {
    pub skills: Vec<String>,
    pub average_ratings: Vec<u64>,
    pub counts: Vec<u64>,
    pub total_skills: u64,
}

/// One row of an [`EndorsementSummary`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SkillSummary<'a> {
    pub skill: &'a str,
    pub average_rating: u64,
    pub count: u64,
}

impl SkillSummary<'_> {
    /// Average as a float, for display.
    pub fn average(&self) -> f64 {
        self.average_rating as f64 / RATING_SCALE as f64
    }
}

impl EndorsementSummary {
    pub fn rows(&self) -> impl Iterator<Item = SkillSummary<'_>> {
        self.skills
            .iter()
            .zip(self.average_ratings.iter())
            .zip(self.counts.iter())
            .map(|((skill, avg), count)| SkillSummary {
                skill: skill.as_str(),
                average_rating: *avg,
                count: *count,
            })
    }

    pub fn is_empty(&self) -> bool {
        self.total_skills == 0
    }
}

/// Compute the summary over the ledger's endorsed-skills index.
pub fn summarize(ledger: &EndorsementLedger) -> EndorsementSummary {
    let mut summary = EndorsementSummary::default();
    for (skill, records) in ledger.iter_indexed() {
        let count = records.len() as u64;
        let sum: u64 = records.iter().map(|e| u64::from(e.rating)).sum();
        // Indexed skills always hold at least one record.
        let average = if count == 0 { 0 } else { sum * RATING_SCALE / count };

        summary.skills.push(skill.to_string());
        summary.average_ratings.push(average);
        summary.counts.push(count);
    }
    summary.total_skills = summary.skills.len() as u64;
    summary
}
