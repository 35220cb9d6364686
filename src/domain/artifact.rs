//! 制品（镜像）引用

use serde::{Deserialize, Serialize};

/// 默认视为可变别名的 tag
pub const DEFAULT_MUTABLE_TAGS: &[&str] = &["latest", "stable", "edge", "nightly", "dev", "main", "master"];

/// 制品引用：仓库 + 不可变版本 tag
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ArtifactReference {
    /// 仓库 (如 rickyjim/todo-app)
    pub repository: String,
    /// 版本 tag (如 v1.2.0)
    pub tag: String,
}

impl ArtifactReference {
    pub fn new(repository: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            tag: tag.into(),
        }
    }

    /// 完整镜像名 `repository:tag`
    pub fn image(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }
}

impl std::fmt::Display for ArtifactReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.image())
    }
}

/// 可变别名判定
///
/// 别名指向的版本会变化，不能作为回滚目标
#[derive(Clone, Debug)]
pub struct TagPolicy {
    mutable_tags: Vec<String>,
}

impl TagPolicy {
    pub fn new<I, S>(mutable_tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            mutable_tags: mutable_tags
                .into_iter()
                .map(|t| t.into().to_lowercase())
                .collect(),
        }
    }

    /// 是否为可变别名
    pub fn is_mutable(&self, tag: &str) -> bool {
        let tag = tag.trim().to_lowercase();
        tag.is_empty() || self.mutable_tags.iter().any(|t| *t == tag)
    }
}

impl Default for TagPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MUTABLE_TAGS.iter().copied())
    }
}

/// 校验 tag 只包含 docker tag 合法字符
pub fn is_valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag.len() <= 128
        && !tag.starts_with(['.', '-'])
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_name() {
        let artifact = ArtifactReference::new("rickyjim/todo-app", "v1.1.0");
        assert_eq!(artifact.image(), "rickyjim/todo-app:v1.1.0");
    }

    #[test]
    fn test_mutable_tags() {
        let policy = TagPolicy::default();
        assert!(policy.is_mutable("latest"));
        assert!(policy.is_mutable("LATEST"));
        assert!(policy.is_mutable(""));
        assert!(!policy.is_mutable("v1.0.0"));
        assert!(!policy.is_mutable("a1b2c3d"));
    }

    #[test]
    fn test_valid_tag() {
        assert!(is_valid_tag("v1.0.0"));
        assert!(is_valid_tag("build_42"));
        assert!(!is_valid_tag("v1; rm -rf /"));
        assert!(!is_valid_tag("-x"));
        assert!(!is_valid_tag(""));
    }
}
