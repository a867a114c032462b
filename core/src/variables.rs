use std::sync::Mutex as StdMutex;

/// One entry in a backend's variable table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    pub name: String,
    /// `None` when the backend only reports names (functions, or value
    /// management disabled).
    pub value: Option<String>,
}

/// How a backend lists its session variables. The session issues
/// `refresh_command()` as an internal expression through the ordinary queue
/// and hands the plain-text response to `parse_listing`.
pub trait VariableProtocol: Send + Sync {
    fn refresh_command(&self) -> String;
    fn parse_listing(&self, text: &str) -> Vec<Variable>;
}

/// Snapshot store for the most recent variable listing. Shared between the
/// session (writer) and frontends (readers).
#[derive(Debug, Default)]
pub struct VariableModel {
    variables: StdMutex<Vec<Variable>>,
}

impl VariableModel {
    pub fn snapshot(&self) -> Vec<Variable> {
        self.lock().clone()
    }

    pub fn get(&self, name: &str) -> Option<Variable> {
        self.lock().iter().find(|v| v.name == name).cloned()
    }

    pub(crate) fn replace(&self, variables: Vec<Variable>) {
        *self.lock() = variables;
    }

    pub(crate) fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Variable>> {
        match self.variables.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
