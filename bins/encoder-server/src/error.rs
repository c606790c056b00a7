use encoder_api::CollaboratorError;
use encoder_engine::EngineError;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("{0}")]
    Engine(#[from] EngineError),

    #[error("{component}: {source}")]
    Collaborator {
        component: &'static str,
        source: CollaboratorError,
    },

    #[error("bind {addr}: {source}")]
    Bind { addr: String, source: std::io::Error },

    #[error("signal: {0}")]
    Signal(#[source] std::io::Error),
}

impl ServerError {
    pub fn collaborator(component: &'static str) -> impl FnOnce(CollaboratorError) -> Self {
        move |source| ServerError::Collaborator { component, source }
    }
}
