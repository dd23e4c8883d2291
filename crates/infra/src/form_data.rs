//! In-memory stand-in for the product's form and response store.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use formplug_core::{FormId, FormMeta, Response, ResponseId};
use formplug_plugins::{DataAccessError, FormReader, QuizResult, ResponseMetadataWriter, ResponseReader};

/// Forms, responses and the quiz metadata written back onto responses.
#[derive(Debug, Default)]
pub struct InMemoryFormData {
    forms: RwLock<HashMap<FormId, FormMeta>>,
    responses: RwLock<HashMap<ResponseId, Response>>,
    quiz_results: RwLock<HashMap<ResponseId, QuizResult>>,
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> DataAccessError {
    DataAccessError("form data store poisoned".to_string())
}

impl InMemoryFormData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn put_form(&self, form: FormMeta) -> Result<(), DataAccessError> {
        self.forms.write().map_err(poisoned)?.insert(form.id, form);
        Ok(())
    }

    pub fn put_response(&self, response: Response) -> Result<(), DataAccessError> {
        self.responses.write().map_err(poisoned)?.insert(response.id, response);
        Ok(())
    }

    pub fn quiz_result(&self, response_id: ResponseId) -> Result<Option<QuizResult>, DataAccessError> {
        Ok(self.quiz_results.read().map_err(poisoned)?.get(&response_id).cloned())
    }
}

#[async_trait]
impl ResponseReader for InMemoryFormData {
    async fn get_by_id(&self, id: ResponseId) -> Result<Option<Response>, DataAccessError> {
        Ok(self.responses.read().map_err(poisoned)?.get(&id).cloned())
    }
}

#[async_trait]
impl FormReader for InMemoryFormData {
    async fn get_by_id(&self, id: FormId) -> Result<Option<FormMeta>, DataAccessError> {
        Ok(self.forms.read().map_err(poisoned)?.get(&id).cloned())
    }
}

#[async_trait]
impl ResponseMetadataWriter for InMemoryFormData {
    async fn write_quiz_result(&self, response_id: ResponseId, result: &QuizResult) -> Result<(), DataAccessError> {
        if !self.responses.read().map_err(poisoned)?.contains_key(&response_id) {
            return Err(DataAccessError(format!("response {response_id} does not exist")));
        }
        self.quiz_results
            .write()
            .map_err(poisoned)?
            .insert(response_id, result.clone());
        Ok(())
    }
}
