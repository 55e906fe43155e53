//! Profile record: the plain fields of a node (name, bio, email, links,
//! skills, visibility). Mutation is owner-only; the guard lives in
//! [`crate::state::NodeState`], this module only validates and applies.

use serde::{Deserialize, Serialize};

use crate::error::{ProfileError, ProfileResult};

pub const MAX_NAME_LEN: usize = 128;
pub const MAX_BIO_LEN: usize = 2048;
pub const MAX_EMAIL_LEN: usize = 254;
pub const MAX_LINKS: usize = 16;
pub const MAX_LINK_LEN: usize = 256;
pub const MAX_SKILLS: usize = 256;
pub const MAX_SKILL_LEN: usize = 64;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub bio: String,
    pub email: String,
    pub links: Vec<String>,
    pub skills: Vec<String>,
    pub is_public: bool,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

/// Replacement values for the descriptive profile fields.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileUpdate {
    pub name: String,
    pub bio: String,
    pub email: String,
    pub links: Vec<String>,
}

impl Profile {
    pub fn new(created_at_ms: u64) -> Self {
        Self {
            is_public: true,
            created_at_ms,
            updated_at_ms: created_at_ms,
            ..Self::default()
        }
    }

    pub fn apply_update(&mut self, update: ProfileUpdate, now_ms: u64) -> ProfileResult<()> {
        check_len("name", &update.name, MAX_NAME_LEN)?;
        check_len("bio", &update.bio, MAX_BIO_LEN)?;
        check_len("email", &update.email, MAX_EMAIL_LEN)?;
        if update.links.len() > MAX_LINKS {
            return Err(ProfileError::invalid(format!(
                "too many links: {} (max {})",
                update.links.len(),
                MAX_LINKS
            )));
        }
        for link in &update.links {
            check_len("link", link, MAX_LINK_LEN)?;
        }

        self.name = update.name;
        self.bio = update.bio;
        self.email = update.email;
        self.links = update.links;
        self.updated_at_ms = now_ms;
        Ok(())
    }

    /// Replace the skill list. Duplicates are collapsed, keeping first occurrence.
    pub fn set_skills(&mut self, skills: Vec<String>, now_ms: u64) -> ProfileResult<()> {
        let mut deduped: Vec<String> = Vec::with_capacity(skills.len());
        for skill in skills {
            validate_skill_name(&skill)?;
            if !deduped.contains(&skill) {
                deduped.push(skill);
            }
        }
        if deduped.len() > MAX_SKILLS {
            return Err(ProfileError::invalid(format!(
                "too many skills: {} (max {})",
                deduped.len(),
                MAX_SKILLS
            )));
        }
        self.skills = deduped;
        self.updated_at_ms = now_ms;
        Ok(())
    }

    pub fn add_skill(&mut self, skill: String, now_ms: u64) -> ProfileResult<()> {
        validate_skill_name(&skill)?;
        if self.has_skill(&skill) {
            return Err(ProfileError::invalid(format!("skill {:?} already listed", skill)));
        }
        if self.skills.len() >= MAX_SKILLS {
            return Err(ProfileError::invalid(format!("too many skills (max {})", MAX_SKILLS)));
        }
        self.skills.push(skill);
        self.updated_at_ms = now_ms;
        Ok(())
    }

    pub fn set_visibility(&mut self, is_public: bool, now_ms: u64) {
        self.is_public = is_public;
        self.updated_at_ms = now_ms;
    }

    pub fn has_skill(&self, skill: &str) -> bool {
        self.skills.iter().any(|s| s == skill)
    }

    pub fn skill_count(&self) -> usize {
        self.skills.len()
    }
}

pub(crate) fn validate_skill_name(skill: &str) -> ProfileResult<()> {
    if skill.trim().is_empty() {
        return Err(ProfileError::invalid("skill name cannot be empty"));
    }
    check_len("skill", skill, MAX_SKILL_LEN)
}

fn check_len(field: &str, value: &str, max: usize) -> ProfileResult<()> {
    if value.len() > max {
        return Err(ProfileError::invalid(format!(
            "{} too long: {} bytes (max {})",
            field,
            value.len(),
            max
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_profile_is_public_and_empty() {
        let profile = Profile::new(42);
        assert!(profile.is_public);
        assert_eq!(profile.skill_count(), 0);
        assert_eq!(profile.created_at_ms, 42);
        assert_eq!(profile.updated_at_ms, 42);
    }

    #[test]
    fn update_replaces_fields_and_bumps_timestamp() {
        let mut profile = Profile::new(1);
        profile
            .apply_update(
                ProfileUpdate {
                    name: "Ada".into(),
                    bio: "engines".into(),
                    email: "ada@example.org".into(),
                    links: vec!["https://example.org/ada".into()],
                },
                5,
            )
            .expect("valid update");

        assert_eq!(profile.name, "Ada");
        assert_eq!(profile.links.len(), 1);
        assert_eq!(profile.updated_at_ms, 5);
        assert_eq!(profile.created_at_ms, 1);
    }

    #[test]
    fn oversized_fields_are_rejected_without_partial_update() {
        let mut profile = Profile::new(1);
        let err = profile
            .apply_update(
                ProfileUpdate {
                    name: "Ada".into(),
                    bio: "x".repeat(MAX_BIO_LEN + 1),
                    ..ProfileUpdate::default()
                },
                2,
            )
            .unwrap_err();

        assert!(matches!(err, ProfileError::InvalidInput(_)));
        assert_eq!(profile.name, "");
        assert_eq!(profile.updated_at_ms, 1);
    }

    #[test]
    fn set_skills_dedupes_in_order() {
        let mut profile = Profile::new(0);
        profile
            .set_skills(vec!["Rust".into(), "Go".into(), "Rust".into()], 1)
            .expect("valid skills");
        assert_eq!(profile.skills, vec!["Rust".to_string(), "Go".to_string()]);
    }

    #[test]
    fn add_skill_rejects_duplicates_and_empty_names() {
        let mut profile = Profile::new(0);
        profile.add_skill("Rust".into(), 1).expect("first add");
        assert!(profile.add_skill("Rust".into(), 2).is_err());
        assert!(profile.add_skill("   ".into(), 2).is_err());
        assert!(profile.add_skill("x".repeat(MAX_SKILL_LEN + 1), 2).is_err());
        assert!(profile.has_skill("Rust"));
        assert_eq!(profile.skill_count(), 1);
    }
}
