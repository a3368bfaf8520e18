//! Search filter expression builder
//!
//! Builds the boolean predicate applied during vector search. The base
//! clause excludes sentinel rows; session and persona clauses are appended
//! when scoping is requested.

/// Filter criteria for memory search
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchFilter {
    session_id: Option<String>,
    persona_id: Option<String>,
}

impl SearchFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_persona_id(mut self, persona_id: impl Into<String>) -> Self {
        self.persona_id = Some(persona_id.into());
        self
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn persona_id(&self) -> Option<&str> {
        self.persona_id.as_deref()
    }

    /// Render the filter as a SQL predicate. Always non-empty: the base
    /// clause rejects placeholder rows with non-positive ids.
    pub fn to_expr(&self) -> String {
        let mut clauses = vec!["memory_id > 0".to_string()];

        if let Some(session_id) = &self.session_id {
            clauses.push(format!("session_id = '{}'", escape(session_id)));
        }

        if let Some(persona_id) = &self.persona_id {
            clauses.push(format!("persona_id = '{}'", escape(persona_id)));
        }

        clauses.join(" AND ")
    }
}

/// Double up single quotes so caller-supplied ids cannot break the
/// predicate.
fn escape(value: &str) -> String {
    value.replace('\'', "''")
}
