//! Task ID generation
//!
//! IDs use the format: `{kind}-{uuid-v7}`
//! Example: `analysis-0192f8a4-5c1e-7b3a-9d2f-3e4a5b6c7d8e`

use super::TaskKind;

/// Generate a task ID for the given kind
///
/// UUID v7 keeps IDs roughly sortable by creation time.
pub fn generate_task_id(kind: TaskKind) -> String {
    let uuid = uuid::Uuid::now_v7();
    format!("{}-{}", kind.as_str().replace('_', "-"), uuid)
}
