use super::ChatMessage;
use crate::models::Persona;

const ASSESSMENT_SCHEMA: &str = r#"{
  "response": "2-4 sentence concise answer here (adjust tone based on persona)",
  "status": "Compliant" or "Non-Compliant" or "Needs Review" or null,
  "reasoning": "Detailed technical analysis here" or null,
  "relevant_clauses": ["clause 1", "clause 2"] or [],
  "sources": [{"document_name": "...", "excerpt": "...", "relevance_score": 0.0}],
  "conversation_type": "analysis" or "follow_up" or "clarification",
  "follow_up_questions": []
}"#;

pub fn system_prompt(persona: Persona) -> String {
    format!(
        "You are an expert Regulatory Compliance Assistant.\n\
         {persona}\n\n\
         CRITICAL: You MUST return a valid JSON object with these exact fields:\n\n\
         {schema}\n\n\
         RESPONSE FIELD (REQUIRED):\n\
         - Keep it 2-4 sentences maximum\n\
         - Direct, conversational answer\n\
         - Example: \"Yes, your policy complies with GDPR Article 5(1)(e). It correctly implements data retention limits and includes proper deletion procedures.\"\n\n\
         IMPORTANT:\n\
         - The 'response' field is MANDATORY and must contain a concise answer.\n\
         - If regulatory context is provided, base your answer STRICTLY on it.\n\
         - If no relevant context is found, you may answer based on your general knowledge but clearly state that this is general advice not based on uploaded documents.",
        persona = persona.instruction(),
        schema = ASSESSMENT_SCHEMA,
    )
}

/// `context` is the token-budgeted history and document text.
pub fn user_prompt(context: &str, query: &str) -> String {
    format!(
        "Regulatory Context:\n{context}\n\n\
         Current Query: {query}\n\n\
         Return ONLY valid JSON. Put the concise answer in 'response' field (REQUIRED), \
         detailed analysis in 'reasoning' field (optional)."
    )
}

pub fn build_messages(persona: Persona, context: &str, query: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(system_prompt(persona)),
        ChatMessage::user(user_prompt(context, query)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Role;

    #[test]
    fn test_persona_is_interpolated() {
        for persona in Persona::ALL {
            let prompt = system_prompt(persona);
            assert!(prompt.contains(persona.instruction()));
            assert!(prompt.contains("\"relevant_clauses\""));
        }
    }

    #[test]
    fn test_messages_layout() {
        let messages = build_messages(Persona::Concise, "ctx", "Do we comply?");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        assert!(messages[1].content.starts_with("Regulatory Context:\nctx\n\n"));
        assert!(messages[1].content.contains("Current Query: Do we comply?"));
    }
}
