//! Form, Question, Whitelist and Response data model plus schema validation.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

use crate::{
    constants::{CONFIRMATION_ID_LEN, MIN_CHOICE_OPTIONS, SEALING_KEY_LEN},
    encoding::is_canonical_hex,
    error::ProtocolError,
    hash::form_id,
    signature::{addresses_match, form_creation_message, response_message},
};

fn invalid(reason: impl Into<String>) -> ProtocolError {
    ProtocolError::Validation(reason.into())
}

// ============================================================================
// Questions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QuestionKind {
    Text,
    Textarea,
    #[serde(alias = "multipleChoice")]
    SingleChoice,
    #[serde(alias = "checkbox")]
    MultiChoice,
}

impl QuestionKind {
    pub fn is_choice(self) -> bool {
        matches!(self, Self::SingleChoice | Self::MultiChoice)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub id:       String,
    pub kind:     QuestionKind,
    pub text:     String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub options:  Vec<String>,
}

fn validate_questions(questions: &[Question]) -> Result<(), ProtocolError> {
    if questions.is_empty() {
        return Err(invalid("form has no questions"));
    }
    let mut seen = HashSet::new();
    for q in questions {
        if q.id.is_empty() {
            return Err(invalid("question with empty id"));
        }
        if !seen.insert(q.id.as_str()) {
            return Err(invalid(format!("duplicate question id {}", q.id)));
        }
        if q.text.trim().is_empty() {
            return Err(invalid(format!("question {} has no text", q.id)));
        }
        if q.kind.is_choice() && q.options.len() < MIN_CHOICE_OPTIONS {
            return Err(invalid(format!(
                "choice question {} needs at least {MIN_CHOICE_OPTIONS} options",
                q.id
            )));
        }
        if !q.kind.is_choice() && !q.options.is_empty() {
            return Err(invalid(format!("free-text question {} carries options", q.id)));
        }
    }
    Ok(())
}

// ============================================================================
// Whitelist
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WhitelistMode {
    #[serde(alias = "none")]
    Open,
    Nft,
    Addresses,
}

/// Who may respond. `value` is the NFT contract reference for `nft` and a
/// comma-separated address list for `addresses`; unused for `open`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Whitelist {
    pub mode:  WhitelistMode,
    #[serde(default)]
    pub value: String,
}

impl Whitelist {
    pub fn open() -> Self {
        Self { mode: WhitelistMode::Open, value: String::new() }
    }

    pub fn nft(contract: impl Into<String>) -> Self {
        Self { mode: WhitelistMode::Nft, value: contract.into() }
    }

    pub fn addresses<I, S>(list: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let value = list
            .into_iter()
            .map(|s| s.as_ref().to_string())
            .collect::<Vec<_>>()
            .join(",");
        Self { mode: WhitelistMode::Addresses, value }
    }

    pub fn is_open(&self) -> bool {
        self.mode == WhitelistMode::Open
    }

    /// Allow-list entries, trimmed, empty entries skipped.
    pub fn allowed_addresses(&self) -> impl Iterator<Item = &str> {
        self.value.split(',').map(str::trim).filter(|s| !s.is_empty())
    }

    pub fn allows_listed(&self, address: &str) -> bool {
        self.allowed_addresses().any(|a| addresses_match(a, address))
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self.mode {
            WhitelistMode::Open => Ok(()),
            WhitelistMode::Nft if self.value.trim().is_empty() => {
                Err(invalid("nft whitelist without contract reference"))
            }
            WhitelistMode::Addresses if self.allowed_addresses().next().is_none() => {
                Err(invalid("address whitelist is empty"))
            }
            _ => Ok(()),
        }
    }
}

impl Default for Whitelist {
    fn default() -> Self {
        Self::open()
    }
}

// ============================================================================
// Form
// ============================================================================

/// What a creator fills in; everything else is stamped by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormDraft {
    pub title:       String,
    #[serde(default)]
    pub description: String,
    pub questions:   Vec<Question>,
    #[serde(default)]
    pub whitelist:   Whitelist,
}

impl FormDraft {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.title.trim().is_empty() {
            return Err(invalid("title is empty"));
        }
        validate_questions(&self.questions)?;
        self.whitelist.validate()
    }

    /// Stamp creator, creation time and sealing key. The returned form
    /// carries a derived id and an empty signature.
    pub fn into_form(self, creator: String, created_at: u64, public_key: String) -> Form {
        Form {
            id: form_id(&self.title, &creator, created_at),
            title: self.title,
            description: self.description,
            creator,
            created_at,
            questions: self.questions,
            whitelist: self.whitelist,
            public_key,
            private_key: String::new(),
            confirmations: BTreeSet::new(),
            responses: Vec::new(),
            creator_signature: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Form {
    pub id:                String,
    pub title:             String,
    #[serde(default)]
    pub description:       String,
    pub creator:           String,
    /// Unix milliseconds.
    pub created_at:        u64,
    pub questions:         Vec<Question>,
    pub whitelist:         Whitelist,
    /// X25519 sealing key, hex.
    pub public_key:        String,
    /// Only ever non-empty inside the creator's own process.
    #[serde(default)]
    pub private_key:       String,
    #[serde(default)]
    pub confirmations:     BTreeSet<String>,
    #[serde(default)]
    pub responses:         Vec<Response>,
    pub creator_signature: String,
}

impl Form {
    pub fn derive_id(&self) -> String {
        form_id(&self.title, &self.creator, self.created_at)
    }

    pub fn signing_message(&self) -> String {
        form_creation_message(&self.title, &self.creator, self.created_at)
    }

    pub fn is_open(&self) -> bool {
        self.whitelist.is_open()
    }

    pub fn is_created_by(&self, address: &str) -> bool {
        addresses_match(&self.creator, address)
    }

    pub fn question(&self, id: &str) -> Option<&Question> {
        self.questions.iter().find(|q| q.id == id)
    }

    pub fn response_from(&self, respondent: &str) -> Option<&Response> {
        self.responses.iter().find(|r| addresses_match(&r.respondent, respondent))
    }

    /// Copy fit for the wire: private key stripped.
    pub fn for_publication(&self) -> Form {
        Form { private_key: String::new(), ..self.clone() }
    }

    /// Schema checks. Signature checks live in `signature::verify_form`.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.title.trim().is_empty() {
            return Err(invalid("title is empty"));
        }
        if self.creator.trim().is_empty() {
            return Err(invalid("creator is empty"));
        }
        validate_questions(&self.questions)?;
        self.whitelist.validate()?;
        if !is_canonical_hex(&self.public_key, SEALING_KEY_LEN) {
            return Err(invalid("publicKey is not canonical 32-byte hex"));
        }
        let expected = self.derive_id();
        if self.id != expected {
            return Err(invalid(format!("id {} does not match derived id {expected}", self.id)));
        }
        Ok(())
    }
}

// ============================================================================
// Responses
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnswerValue {
    Text(String),
    Choices(Vec<String>),
}

impl AnswerValue {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(s) => s.trim().is_empty(),
            Self::Choices(c) => c.is_empty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Answer {
    pub question_id: String,
    pub value:       AnswerValue,
}

impl Answer {
    pub fn text(question_id: impl Into<String>, value: impl Into<String>) -> Self {
        Self { question_id: question_id.into(), value: AnswerValue::Text(value.into()) }
    }

    pub fn choices<I, S>(question_id: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            question_id: question_id.into(),
            value: AnswerValue::Choices(values.into_iter().map(Into::into).collect()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub form_id:                 String,
    pub respondent:              String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub respondent_display_name: Option<String>,
    /// Unix milliseconds.
    pub submitted_at:            u64,
    /// Empty for open forms.
    #[serde(default)]
    pub signature:               String,
    pub confirmation_id:         String,
    pub answers:                 Vec<Answer>,
}

impl Response {
    pub fn signing_message(&self) -> String {
        response_message(&self.form_id, &self.respondent, self.submitted_at)
    }

    pub fn answer(&self, question_id: &str) -> Option<&AnswerValue> {
        self.answers.iter().find(|a| a.question_id == question_id).map(|a| &a.value)
    }

    /// Schema checks against the target form's questions.
    pub fn validate_against(&self, form: &Form) -> Result<(), ProtocolError> {
        if self.form_id.is_empty() {
            return Err(invalid("formId is empty"));
        }
        if self.form_id != form.id {
            return Err(invalid(format!("response targets {}, not {}", self.form_id, form.id)));
        }
        if self.respondent.trim().is_empty() {
            return Err(invalid("respondent is empty"));
        }
        if !is_canonical_hex(&self.confirmation_id, CONFIRMATION_ID_LEN) {
            return Err(invalid("confirmationId is not canonical 32-byte hex"));
        }

        let mut answered = HashSet::new();
        for answer in &self.answers {
            let question = form
                .question(&answer.question_id)
                .ok_or_else(|| invalid(format!("answer to unknown question {}", answer.question_id)))?;
            if !answered.insert(question.id.as_str()) {
                return Err(invalid(format!("question {} answered twice", question.id)));
            }
            validate_answer(question, &answer.value)?;
        }

        for q in form.questions.iter().filter(|q| q.required) {
            if !self.answer(&q.id).is_some_and(|v| !v.is_empty()) {
                return Err(invalid(format!("required question {} unanswered", q.id)));
            }
        }
        Ok(())
    }
}

fn validate_answer(question: &Question, value: &AnswerValue) -> Result<(), ProtocolError> {
    let offered = |choice: &String| question.options.contains(choice);
    match (question.kind, value) {
        (QuestionKind::Text | QuestionKind::Textarea, AnswerValue::Text(_)) => Ok(()),
        (QuestionKind::SingleChoice, AnswerValue::Text(choice)) => {
            if choice.is_empty() || offered(choice) {
                Ok(())
            } else {
                Err(invalid(format!("{choice:?} is not an option of {}", question.id)))
            }
        }
        (QuestionKind::MultiChoice, AnswerValue::Choices(choices)) => {
            let mut picked = HashSet::new();
            for choice in choices {
                if !offered(choice) {
                    return Err(invalid(format!("{choice:?} is not an option of {}", question.id)));
                }
                if !picked.insert(choice) {
                    return Err(invalid(format!("{choice:?} picked twice for {}", question.id)));
                }
            }
            Ok(())
        }
        (kind, _) => Err(invalid(format!(
            "answer to {} has the wrong shape for a {kind:?} question",
            question.id
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sealing::FormKeyPair;

    fn poll_draft() -> FormDraft {
        FormDraft {
            title: "Poll".into(),
            description: "Lunch".into(),
            questions: vec![
                Question {
                    id: "q1".into(),
                    kind: QuestionKind::SingleChoice,
                    text: "Where?".into(),
                    required: true,
                    options: vec!["north".into(), "south".into()],
                },
                Question {
                    id: "q2".into(),
                    kind: QuestionKind::MultiChoice,
                    text: "What?".into(),
                    required: false,
                    options: vec!["soup".into(), "salad".into(), "bread".into()],
                },
                Question {
                    id: "q3".into(),
                    kind: QuestionKind::Textarea,
                    text: "Notes".into(),
                    required: false,
                    options: vec![],
                },
            ],
            whitelist: Whitelist::open(),
        }
    }

    fn poll_form() -> Form {
        poll_draft().into_form("0xC1".into(), 1_700_000_000_000, FormKeyPair::generate().public_key)
    }

    fn response_to(form: &Form, answers: Vec<Answer>) -> Response {
        Response {
            form_id: form.id.clone(),
            respondent: "0xR1".into(),
            respondent_display_name: None,
            submitted_at: 1_700_000_000_500,
            signature: String::new(),
            confirmation_id: "ab".repeat(32),
            answers,
        }
    }

    #[test]
    fn draft_into_form_derives_id() {
        let form = poll_form();
        assert_eq!(form.id, form_id("Poll", "0xC1", 1_700_000_000_000));
        form.validate().unwrap();
    }

    #[test]
    fn edited_title_breaks_id() {
        let mut form = poll_form();
        form.title = "Poll v2".into();
        assert!(matches!(form.validate(), Err(ProtocolError::Validation(_))));
    }

    #[test]
    fn choice_questions_need_two_options() {
        let mut draft = poll_draft();
        draft.questions[0].options.truncate(1);
        assert!(draft.validate().is_err());
    }

    #[test]
    fn duplicate_question_ids_rejected() {
        let mut draft = poll_draft();
        draft.questions[1].id = "q1".into();
        assert!(draft.validate().is_err());
    }

    #[test]
    fn whitelist_values_required() {
        let mut draft = poll_draft();
        draft.whitelist = Whitelist::addresses([" ", ""]);
        assert!(draft.validate().is_err());
        draft.whitelist = Whitelist::nft("");
        assert!(draft.validate().is_err());
    }

    #[test]
    fn address_list_membership() {
        let wl = Whitelist { mode: WhitelistMode::Addresses, value: "0xAAA, 0xBBB".into() };
        assert!(wl.allows_listed("0xaaa"));
        assert!(wl.allows_listed("0xBBB"));
        assert!(!wl.allows_listed("0xCCC"));
    }

    #[test]
    fn legacy_none_mode_is_open() {
        let wl: Whitelist = serde_json::from_str(r#"{"mode":"none","value":""}"#).unwrap();
        assert!(wl.is_open());
        assert_eq!(serde_json::to_string(&wl).unwrap(), r#"{"mode":"open","value":""}"#);
    }

    #[test]
    fn publication_copy_has_no_private_key() {
        let mut form = poll_form();
        form.private_key = "11".repeat(32);
        let public = form.for_publication();
        assert!(public.private_key.is_empty());
        assert_eq!(public.id, form.id);
    }

    #[test]
    fn well_formed_response_passes() {
        let form = poll_form();
        let resp = response_to(
            &form,
            vec![Answer::text("q1", "north"), Answer::choices("q2", ["soup", "bread"])],
        );
        resp.validate_against(&form).unwrap();
    }

    #[test]
    fn missing_required_answer_rejected() {
        let form = poll_form();
        let resp = response_to(&form, vec![Answer::text("q3", "hi")]);
        assert!(resp.validate_against(&form).is_err());
    }

    #[test]
    fn answer_shape_and_options_enforced() {
        let form = poll_form();
        let wrong_shape = response_to(&form, vec![Answer::choices("q1", ["north"])]);
        assert!(wrong_shape.validate_against(&form).is_err());

        let not_offered = response_to(&form, vec![Answer::text("q1", "east")]);
        assert!(not_offered.validate_against(&form).is_err());

        let twice = response_to(
            &form,
            vec![Answer::text("q1", "north"), Answer::text("q1", "south")],
        );
        assert!(twice.validate_against(&form).is_err());

        let unknown = response_to(&form, vec![Answer::text("q1", "north"), Answer::text("q9", "x")]);
        assert!(unknown.validate_against(&form).is_err());
    }

    #[test]
    fn confirmation_id_must_be_32_bytes() {
        let form = poll_form();
        let mut resp = response_to(&form, vec![Answer::text("q1", "north")]);
        resp.confirmation_id = "1700000000500".into();
        assert!(resp.validate_against(&form).is_err());
    }

    #[test]
    fn answer_values_decode_untagged() {
        let a: Answer = serde_json::from_str(r#"{"questionId":"q1","value":"north"}"#).unwrap();
        assert_eq!(a.value, AnswerValue::Text("north".into()));
        let b: Answer = serde_json::from_str(r#"{"questionId":"q2","value":["soup"]}"#).unwrap();
        assert_eq!(b.value, AnswerValue::Choices(vec!["soup".into()]));
    }

    #[test]
    fn response_lookup_is_case_insensitive() {
        let mut form = poll_form();
        form.responses.push(response_to(&form, vec![Answer::text("q1", "north")]));
        assert!(form.response_from("0xr1").is_some());
        assert!(form.is_created_by("0xc1"));
    }
}
