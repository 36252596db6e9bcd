//! Local form repository: the authoritative store of known forms, their
//! responses and confirmations, plus the local role tag of each form.
//!
//! Key layout in the backing store:
//!   form/{id}                         form without private key, responses, confirmations
//!   role/{id}                         Role
//!   response/{formId}/{respondent}    Response (respondent lowercased)
//!   confirmation/{formId}/{cid}       Confirmation

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use whisperbox_protocol::{
    form::{Form, Response},
    payload::Confirmation,
};

use crate::{
    access::AccessEvaluator,
    error::EngineError,
    kv::{put_cbor, scan_cbor, KvStore},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Creator,
    Accessible,
    Viewed,
    Participated,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Creator      => "creator",
            Self::Accessible   => "accessible",
            Self::Viewed       => "viewed",
            Self::Participated => "participated",
        }
    }

    pub fn can_become(self, next: Role) -> bool {
        matches!(
            (self, next),
            (Self::Accessible, Self::Viewed)
                | (Self::Accessible, Self::Participated)
                | (Self::Viewed, Self::Participated)
        )
    }
}

impl FromStr for Role {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [Self::Creator, Self::Accessible, Self::Viewed, Self::Participated]
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| EngineError::Validation(format!("unknown role {s:?}")))
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn form_key(id: &str) -> String {
    format!("form/{id}")
}

fn role_key(id: &str) -> String {
    format!("role/{id}")
}

fn response_key(form_id: &str, respondent: &str) -> String {
    format!("response/{form_id}/{}", respondent.to_lowercase())
}

fn confirmation_key(form_id: &str, confirmation_id: &str) -> String {
    format!("confirmation/{form_id}/{confirmation_id}")
}

pub struct FormRepository {
    kv:     Arc<dyn KvStore>,
    access: AccessEvaluator,
    forms:  HashMap<String, Form>,
    roles:  HashMap<String, Role>,
}

impl FormRepository {
    /// Load everything persisted in `kv`.
    pub fn open(kv: Arc<dyn KvStore>, access: AccessEvaluator) -> Result<Self, EngineError> {
        let mut forms = HashMap::new();
        for (_, form) in scan_cbor::<Form>(kv.as_ref(), "form/")? {
            forms.insert(form.id.clone(), form);
        }

        let mut roles = HashMap::new();
        for (key, role) in scan_cbor::<Role>(kv.as_ref(), "role/")? {
            if let Some(id) = key.strip_prefix("role/") {
                roles.insert(id.to_string(), role);
            }
        }
        // A form without a readable role is unusable.
        forms.retain(|id, _| roles.contains_key(id));

        for form in forms.values_mut() {
            for (_, response) in scan_cbor::<Response>(kv.as_ref(), &format!("response/{}/", form.id))? {
                form.responses.push(response);
            }
            form.responses.sort_by_key(|r| r.submitted_at);
            for (_, c) in scan_cbor::<Confirmation>(kv.as_ref(), &format!("confirmation/{}/", form.id))? {
                form.confirmations.insert(c.confirmation_id);
            }
        }

        if !forms.is_empty() {
            tracing::info!("Loaded {} forms from store", forms.len());
        }
        Ok(Self { kv, access, forms, roles })
    }

    pub fn access(&self) -> &AccessEvaluator {
        &self.access
    }

    pub fn is_empty(&self) -> bool {
        self.forms.is_empty()
    }

    pub fn len(&self) -> usize {
        self.forms.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.forms.contains_key(id)
    }

    pub fn get_form(&self, id: &str) -> Option<&Form> {
        self.forms.get(id)
    }

    pub fn role(&self, id: &str) -> Option<Role> {
        self.roles.get(id).copied()
    }

    /// Newest first.
    pub fn list_by_creator(&self, creator: &str) -> Vec<&Form> {
        self.sorted(self.forms.values().filter(|f| f.is_created_by(creator)))
    }

    /// Newest first.
    pub fn list_by_role(&self, role: Role) -> Vec<&Form> {
        self.sorted(self.forms.values().filter(|f| self.role(&f.id) == Some(role)))
    }

    /// Newest first.
    pub fn list_all(&self) -> Vec<&Form> {
        self.sorted(self.forms.values())
    }

    fn sorted<'a>(&self, forms: impl Iterator<Item = &'a Form>) -> Vec<&'a Form> {
        let mut out: Vec<&Form> = forms.collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        out
    }

    pub fn has_responded(&self, form_id: &str, address: &str) -> bool {
        self.forms
            .get(form_id)
            .is_some_and(|f| f.response_from(address).is_some())
    }

    pub fn insert_form(&mut self, form: Form, role: Role) -> Result<(), EngineError> {
        if self.forms.contains_key(&form.id) {
            return Err(EngineError::Duplicate(format!("form {}", form.id)));
        }
        let stored = Form {
            private_key:   String::new(),
            responses:     Vec::new(),
            confirmations: Default::default(),
            ..form
        };
        put_cbor(self.kv.as_ref(), &form_key(&stored.id), &stored)?;
        put_cbor(self.kv.as_ref(), &role_key(&stored.id), &role)?;
        self.roles.insert(stored.id.clone(), role);
        self.forms.insert(stored.id.clone(), stored);
        Ok(())
    }

    /// One response per respondent; access is re-checked at insertion time.
    pub async fn insert_response(&mut self, response: Response) -> Result<(), EngineError> {
        let form = self
            .forms
            .get(&response.form_id)
            .ok_or_else(|| EngineError::FormNotFound(response.form_id.clone()))?;

        if form.response_from(&response.respondent).is_some() {
            return Err(EngineError::Duplicate(format!(
                "response from {} to form {}",
                response.respondent, response.form_id
            )));
        }
        if !self.access.can_access(form, Some(&response.respondent)).await {
            return Err(EngineError::AccessDenied {
                form_id: response.form_id.clone(),
                address: response.respondent.clone(),
            });
        }

        put_cbor(
            self.kv.as_ref(),
            &response_key(&response.form_id, &response.respondent),
            &response,
        )?;
        if let Some(form) = self.forms.get_mut(&response.form_id) {
            form.responses.push(response);
        }
        Ok(())
    }

    /// Returns false if the confirmation was already recorded.
    pub fn insert_confirmation(
        &mut self,
        form_id:         &str,
        confirmation_id: &str,
    ) -> Result<bool, EngineError> {
        let form = self
            .forms
            .get_mut(form_id)
            .ok_or_else(|| EngineError::FormNotFound(form_id.to_string()))?;
        if form.confirmations.contains(confirmation_id) {
            return Ok(false);
        }
        put_cbor(
            self.kv.as_ref(),
            &confirmation_key(form_id, confirmation_id),
            &Confirmation::new(form_id, confirmation_id),
        )?;
        form.confirmations.insert(confirmation_id.to_string());
        Ok(true)
    }

    /// Move a form to `role`. Returns false when it already has that role.
    pub fn tag(&mut self, id: &str, role: Role) -> Result<bool, EngineError> {
        let current = self
            .role(id)
            .ok_or_else(|| EngineError::FormNotFound(id.to_string()))?;
        if current == role {
            return Ok(false);
        }
        if !current.can_become(role) {
            return Err(EngineError::Validation(format!(
                "form {id} cannot move from {current} to {role}"
            )));
        }
        put_cbor(self.kv.as_ref(), &role_key(id), &role)?;
        self.roles.insert(id.to_string(), role);
        Ok(true)
    }
}
