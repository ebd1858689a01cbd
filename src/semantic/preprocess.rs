//! Canonical text used to embed a skill.
//!
//! The layout is part of the index format: changing it makes previously
//! stored vectors incomparable with new query vectors.
//!
//! `name. description. tags: a, b. frameworks: x. languages: y. libraries: z`
//!
//! Empty sections are omitted and the result is lowercased.

use crate::skill::SkillSummary;

/// Build the canonical lowercase representation of a skill.
pub fn skill_text(skill: &SkillSummary) -> String {
    let mut parts: Vec<String> = Vec::with_capacity(6);

    push_trimmed(&mut parts, &skill.name);
    push_trimmed(&mut parts, &skill.description);
    push_list(&mut parts, "tags", &skill.tags);
    push_list(&mut parts, "frameworks", &skill.compatibility.frameworks);
    push_list(&mut parts, "languages", &skill.compatibility.languages);
    push_list(&mut parts, "libraries", &skill.compatibility.libraries);

    parts.join(". ").to_lowercase()
}

fn push_trimmed(parts: &mut Vec<String>, value: &str) {
    let value = value.trim();
    if !value.is_empty() {
        parts.push(value.to_string());
    }
}

fn push_list(parts: &mut Vec<String>, label: &str, values: &[String]) {
    let values: Vec<&str> = values
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .collect();

    if !values.is_empty() {
        parts.push(format!("{}: {}", label, values.join(", ")));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skill::Compatibility;

    #[test]
    fn test_full_layout() {
        let mut skill = SkillSummary::new("React-Auth", "Login flows for React")
            .with_tags(["react", "auth"]);
        skill.compatibility = Compatibility {
            frameworks: vec!["Next.js".to_string()],
            languages: vec!["TypeScript".to_string()],
            libraries: vec![],
        };

        assert_eq!(
            skill_text(&skill),
            "react-auth. login flows for react. tags: react, auth. frameworks: next.js. languages: typescript"
        );
    }

    #[test]
    fn test_name_only() {
        let skill = SkillSummary::new("  vue-forms  ", "");
        assert_eq!(skill_text(&skill), "vue-forms");
    }

    #[test]
    fn test_blank_tags_are_skipped() {
        let skill = SkillSummary::new("x", "y").with_tags(["", "  "]);
        assert_eq!(skill_text(&skill), "x. y");
    }
}
