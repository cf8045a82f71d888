use std::fmt;

use serde_derive::Serialize;

/// A named operation bound to one docker image and tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Task {
    pub name: String,
    pub docker_image: String,
    pub docker_registry: String,
    pub docker_tag: String,
    pub docker_digest: Option<String>,
}

impl Task {
    pub fn new(
        name: &str,
        docker_image: &str,
        docker_tag: &str,
        docker_registry: &str,
        docker_digest: Option<String>,
        override_registry: Option<&str>,
    ) -> Self {
        Task {
            name: name.to_string(),
            docker_image: docker_image.to_string(),
            docker_registry: override_registry.unwrap_or(docker_registry).to_string(),
            docker_tag: docker_tag.to_string(),
            docker_digest,
        }
    }

    /// Key shared by every task that runs in the same image and tag.
    pub fn image_key(&self) -> String {
        format!("{}:{}", self.docker_image, self.docker_tag)
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string_pretty(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => Err(fmt::Error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_registry_replaces_configured_one() {
        let task = Task::new("detectnet_v2", "nvidia/tao/tao-toolkit", "5.0.0-tf1.15.5", "nvcr.io", None, Some("registry.local"));
        assert_eq!(task.docker_registry, "registry.local");
        let task = Task::new("detectnet_v2", "nvidia/tao/tao-toolkit", "5.0.0-tf1.15.5", "nvcr.io", None, None);
        assert_eq!(task.docker_registry, "nvcr.io");
    }

    #[test]
    fn displays_as_json() {
        let task = Task::new("dino", "nvidia/tao/tao-toolkit", "5.0.0-pyt", "nvcr.io", Some("sha256:abc".into()), None);
        let json: serde_json::Value = serde_json::from_str(&task.to_string()).unwrap();
        assert_eq!(json["name"], "dino");
        assert_eq!(json["docker_digest"], "sha256:abc");
        assert_eq!(json.as_object().unwrap().len(), 5);
        assert_eq!(task.image_key(), "nvidia/tao/tao-toolkit:5.0.0-pyt");
    }
}
