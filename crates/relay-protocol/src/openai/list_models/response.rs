use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelObject>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelObject {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

impl ModelList {
    pub fn new<I>(models: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Self {
            object: "list".to_string(),
            data: models
                .into_iter()
                .map(|(id, owned_by)| ModelObject {
                    id,
                    object: "model".to_string(),
                    created: 1_626_777_600,
                    owned_by,
                })
                .collect(),
        }
    }
}
