//! Lazy job space and static exclusion rules.

use serde::{Deserialize, Serialize};

use crate::core::types::{JobKey, Primitive, Recipe};

/// A borrowed (primitive, recipe) pair.
#[derive(Debug, Clone, Copy)]
pub struct Job<'a> {
    pub primitive: &'a Primitive,
    pub recipe: &'a Recipe,
}

impl Job<'_> {
    pub fn key(&self) -> JobKey {
        JobKey::new(self.primitive.id.clone(), self.recipe.clone())
    }
}

/// Cross product of primitives and recipes, iterated primitives-outer.
///
/// The iteration order is fully determined by the input order, so a resumed
/// run walks the same sequence and skips what the completion set already holds.
#[derive(Debug, Clone, Copy)]
pub struct JobSpace<'a> {
    primitives: &'a [Primitive],
    recipes: &'a [Recipe],
}

impl<'a> JobSpace<'a> {
    pub fn new(primitives: &'a [Primitive], recipes: &'a [Recipe]) -> Self {
        Self {
            primitives,
            recipes,
        }
    }

    pub fn len(&self) -> usize {
        self.primitives.len() * self.recipes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(self) -> impl Iterator<Item = Job<'a>> + 'a {
        let recipes = self.recipes;
        self.primitives.iter().flat_map(move |primitive| {
            recipes.iter().map(move |recipe| Job { primitive, recipe })
        })
    }
}

/// Static rule forbidding a job (`[[exclusions]]` entry).
///
/// A rule with only `primitive` excludes every recipe for that primitive; a
/// rule with only `technique` excludes that technique for every primitive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusionRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primitive: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub technique: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ExclusionRule {
    pub fn is_valid(&self) -> bool {
        self.primitive.is_some() || self.technique.is_some()
    }

    pub fn matches(&self, job: &Job<'_>) -> bool {
        if !self.is_valid() {
            return false;
        }
        let primitive_ok = self
            .primitive
            .as_deref()
            .is_none_or(|id| id == job.primitive.id);
        let technique_ok = self
            .technique
            .as_deref()
            .is_none_or(|technique| job.recipe.contains(technique));
        primitive_ok && technique_ok
    }

    pub fn describe(&self) -> String {
        let target = match (&self.primitive, &self.technique) {
            (Some(p), Some(t)) => format!("primitive {p} with technique {t}"),
            (Some(p), None) => format!("primitive {p}"),
            (None, Some(t)) => format!("technique {t}"),
            (None, None) => "nothing".to_string(),
        };
        match &self.reason {
            Some(reason) => format!("excluded {target}: {reason}"),
            None => format!("excluded {target}"),
        }
    }
}

/// Return the first rule that forbids `job`.
pub fn find_exclusion<'r>(rules: &'r [ExclusionRule], job: &Job<'_>) -> Option<&'r ExclusionRule> {
    rules.iter().find(|rule| rule.matches(job))
}
