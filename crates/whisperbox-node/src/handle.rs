use tokio::sync::{mpsc, oneshot};
use whisperbox_protocol::form::{Answer, Form, FormDraft, Response};

use crate::{error::EngineError, events::EngineState, repository::Role};

pub(crate) type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

/// Local actions queued to the engine task, each with its own reply channel.
pub(crate) enum Command {
    Initialize(Reply<()>),
    CreateForm {
        draft: FormDraft,
        reply: Reply<Form>,
    },
    SubmitResponse {
        form_id:      String,
        answers:      Vec<Answer>,
        display_name: Option<String>,
        reply:        Reply<Response>,
    },
    NavigateTo {
        form_id: Option<String>,
        reply:   Reply<()>,
    },
    GrantAccess {
        form_id: String,
        reply:   Reply<()>,
    },
    GetForm {
        form_id: String,
        reply:   Reply<Option<Form>>,
    },
    ListForms {
        role:  Option<Role>,
        reply: Reply<Vec<Form>>,
    },
    State(Reply<EngineState>),
}

/// Cheaply cloneable front door to a running `Engine`.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Command>,
}

impl EngineHandle {
    pub(crate) fn new(tx: mpsc::Sender<Command>) -> Self {
        Self { tx }
    }

    async fn call<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(build(reply)).await.map_err(|_| EngineError::Shutdown)?;
        rx.await.map_err(|_| EngineError::Shutdown)?
    }

    /// Re-run initialization, e.g. after it failed.
    pub async fn initialize(&self) -> Result<(), EngineError> {
        self.call(Command::Initialize).await
    }

    pub async fn create_form(&self, draft: FormDraft) -> Result<Form, EngineError> {
        self.call(|reply| Command::CreateForm { draft, reply }).await
    }

    pub async fn submit_response(
        &self,
        form_id:      &str,
        answers:      Vec<Answer>,
        display_name: Option<String>,
    ) -> Result<Response, EngineError> {
        let form_id = form_id.to_string();
        self.call(|reply| Command::SubmitResponse { form_id, answers, display_name, reply })
            .await
    }

    pub async fn navigate_to(&self, form_id: Option<&str>) -> Result<(), EngineError> {
        let form_id = form_id.map(str::to_string);
        self.call(|reply| Command::NavigateTo { form_id, reply }).await
    }

    pub async fn grant_access(&self, form_id: &str) -> Result<(), EngineError> {
        let form_id = form_id.to_string();
        self.call(|reply| Command::GrantAccess { form_id, reply }).await
    }

    pub async fn form(&self, form_id: &str) -> Result<Option<Form>, EngineError> {
        let form_id = form_id.to_string();
        self.call(|reply| Command::GetForm { form_id, reply }).await
    }

    pub async fn forms(&self, role: Option<Role>) -> Result<Vec<Form>, EngineError> {
        self.call(|reply| Command::ListForms { role, reply }).await
    }

    pub async fn state(&self) -> Result<EngineState, EngineError> {
        self.call(Command::State).await
    }
}
