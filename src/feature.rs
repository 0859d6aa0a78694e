//! Device feature descriptors
//!
//! An input device feature (IDF) is a stream the device pushes to the server,
//! an output device feature (ODF) is a stream the server delivers to the
//! device. Features are described to the server at registration time by
//! their [`DeviceFeature::profile`].

use std::fmt;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::error::RegistrationError;

/// Receives inbound data: `(feature, payload)`
pub type DataHandler = Arc<dyn Fn(&str, Value) + Send + Sync>;

/// Produces the next outbound value for an input feature, if any
pub type DataProducer = Arc<dyn Fn() -> Option<Value> + Send + Sync>;

#[derive(Clone)]
pub struct DeviceFeature {
    name: String,
    df_type: Vec<String>,
    on_data: Option<DataHandler>,
    push_data: Option<DataProducer>,
}

impl DeviceFeature {
    /// Creates a feature with the given type/unit tags
    ///
    /// Fails when `name` is empty, since the server keys features by name.
    pub fn new<I, T>(name: impl Into<String>, df_type: I) -> Result<Self, RegistrationError>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(RegistrationError::InvalidFeature(
                "feature name must not be empty".to_string(),
            ));
        }

        Ok(Self {
            name,
            df_type: df_type.into_iter().map(Into::into).collect(),
            on_data: None,
            push_data: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn df_type(&self) -> &[String] {
        &self.df_type
    }

    pub fn on_data(&self) -> Option<&DataHandler> {
        self.on_data.as_ref()
    }

    pub fn push_data(&self) -> Option<&DataProducer> {
        self.push_data.as_ref()
    }

    /// Assigns the inbound handler; assigning nothing is rejected right away
    pub fn set_on_data(&mut self, handler: Option<DataHandler>) -> Result<(), RegistrationError> {
        let handler = handler.ok_or_else(|| RegistrationError::MissingHandler(self.name.clone()))?;
        self.on_data = Some(handler);
        Ok(())
    }

    /// Assigns the outbound producer; assigning nothing is rejected right away
    pub fn set_push_data(
        &mut self,
        producer: Option<DataProducer>,
    ) -> Result<(), RegistrationError> {
        let producer =
            producer.ok_or_else(|| RegistrationError::MissingHandler(self.name.clone()))?;
        self.push_data = Some(producer);
        Ok(())
    }

    pub fn with_on_data<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, Value) + Send + Sync + 'static,
    {
        self.on_data = Some(Arc::new(handler));
        self
    }

    pub fn with_push_data<F>(mut self, producer: F) -> Self
    where
        F: Fn() -> Option<Value> + Send + Sync + 'static,
    {
        self.push_data = Some(Arc::new(producer));
        self
    }

    /// `[name, [tags...]]` as sent in `idf_list`/`odf_list`
    ///
    /// A feature without tags is described as `[name, [null]]`.
    pub fn profile(&self) -> Value {
        if self.df_type.is_empty() {
            json!([self.name, [Value::Null]])
        } else {
            json!([self.name, self.df_type])
        }
    }
}

impl fmt::Debug for DeviceFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceFeature")
            .field("name", &self.name)
            .field("df_type", &self.df_type)
            .field("on_data", &self.on_data.is_some())
            .field("push_data", &self.push_data.is_some())
            .finish()
    }
}
