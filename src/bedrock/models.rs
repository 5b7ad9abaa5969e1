//! 客户端模型名 → Bedrock 模型 ID

use std::collections::HashMap;

const BUILTIN_ALIASES: &[(&str, &str)] = &[
    // Claude Opus 4.1 / 4
    ("claude-opus-4-1", "us.anthropic.claude-opus-4-1-20250805-v1:0"),
    ("claude-opus-4-1-20250805", "us.anthropic.claude-opus-4-1-20250805-v1:0"),
    ("claude-opus-4", "us.anthropic.claude-opus-4-20250514-v1:0"),
    ("claude-opus-4-0", "us.anthropic.claude-opus-4-20250514-v1:0"),
    ("claude-opus-4-20250514", "us.anthropic.claude-opus-4-20250514-v1:0"),
    // Claude Sonnet 4
    ("claude-sonnet-4", "us.anthropic.claude-sonnet-4-20250514-v1:0"),
    ("claude-sonnet-4-0", "us.anthropic.claude-sonnet-4-20250514-v1:0"),
    ("claude-sonnet-4-20250514", "us.anthropic.claude-sonnet-4-20250514-v1:0"),
    // Claude 3.7 Sonnet
    ("claude-3-7-sonnet", "us.anthropic.claude-3-7-sonnet-20250219-v1:0"),
    ("claude-3-7-sonnet-latest", "us.anthropic.claude-3-7-sonnet-20250219-v1:0"),
    ("claude-3-7-sonnet-20250219", "us.anthropic.claude-3-7-sonnet-20250219-v1:0"),
    // Claude 3.5 Sonnet
    ("claude-3-5-sonnet", "us.anthropic.claude-3-5-sonnet-20241022-v2:0"),
    ("claude-3-5-sonnet-latest", "us.anthropic.claude-3-5-sonnet-20241022-v2:0"),
    ("claude-3-5-sonnet-20241022", "us.anthropic.claude-3-5-sonnet-20241022-v2:0"),
    ("claude-3-5-sonnet-20240620", "us.anthropic.claude-3-5-sonnet-20240620-v1:0"),
    // Claude 3.5 Haiku
    ("claude-3-5-haiku", "us.anthropic.claude-3-5-haiku-20241022-v1:0"),
    ("claude-3-5-haiku-latest", "us.anthropic.claude-3-5-haiku-20241022-v1:0"),
    ("claude-3-5-haiku-20241022", "us.anthropic.claude-3-5-haiku-20241022-v1:0"),
    // Claude 3
    ("claude-3-opus", "us.anthropic.claude-3-opus-20240229-v1:0"),
    ("claude-3-opus-20240229", "us.anthropic.claude-3-opus-20240229-v1:0"),
    ("claude-3-sonnet", "us.anthropic.claude-3-sonnet-20240229-v1:0"),
    ("claude-3-sonnet-20240229", "us.anthropic.claude-3-sonnet-20240229-v1:0"),
    ("claude-3-haiku", "us.anthropic.claude-3-haiku-20240307-v1:0"),
    ("claude-3-haiku-20240307", "us.anthropic.claude-3-haiku-20240307-v1:0"),
    // 旧版 Text Completions
    ("claude-2", "anthropic.claude-v2"),
    ("claude-2.0", "anthropic.claude-v2"),
    ("claude-2.1", "anthropic.claude-v2:1"),
    ("claude-instant-1", "anthropic.claude-instant-v1"),
    ("claude-instant-1.2", "anthropic.claude-instant-v1"),
];

/// 启动时构建，之后只读
#[derive(Debug, Clone)]
pub struct ModelResolver {
    aliases: HashMap<String, String>,
}

impl ModelResolver {
    /// 内置别名叠加配置中的 `modelMappings`
    pub fn new(overrides: &HashMap<String, String>) -> Self {
        let mut aliases: HashMap<String, String> = BUILTIN_ALIASES
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        aliases.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self { aliases }
    }

    /// 解析出实际调用（也是计费用）的模型 ID
    pub fn resolve(&self, model: &str) -> String {
        let model = model.trim();
        if let Some(mapped) = self.aliases.get(model) {
            return mapped.clone();
        }
        if !is_bedrock_id(model) {
            tracing::warn!(model = %model, "未找到模型映射，按原样转发");
        }
        model.to_string()
    }
}

impl Default for ModelResolver {
    fn default() -> Self {
        Self::new(&HashMap::new())
    }
}

fn is_bedrock_id(model: &str) -> bool {
    model.starts_with("anthropic.") || model.contains(".anthropic.") || model.starts_with("arn:")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_alias() {
        let resolver = ModelResolver::default();
        assert_eq!(
            resolver.resolve("claude-3-5-haiku-20241022"),
            "us.anthropic.claude-3-5-haiku-20241022-v1:0"
        );
        assert_eq!(resolver.resolve("claude-2.1"), "anthropic.claude-v2:1");
    }

    #[test]
    fn test_bedrock_ids_pass_through() {
        let resolver = ModelResolver::default();
        for id in [
            "anthropic.claude-3-haiku-20240307-v1:0",
            "eu.anthropic.claude-3-haiku-20240307-v1:0",
        ] {
            assert_eq!(resolver.resolve(id), id);
        }
    }

    #[test]
    fn test_config_overrides_builtin() {
        let overrides = HashMap::from([
            (
                "claude-sonnet-4".to_string(),
                "eu.anthropic.claude-sonnet-4-20250514-v1:0".to_string(),
            ),
            ("house-model".to_string(), "anthropic.claude-v2".to_string()),
        ]);
        let resolver = ModelResolver::new(&overrides);
        assert_eq!(
            resolver.resolve("claude-sonnet-4"),
            "eu.anthropic.claude-sonnet-4-20250514-v1:0"
        );
        assert_eq!(resolver.resolve("house-model"), "anthropic.claude-v2");
        assert_eq!(resolver.resolve("unknown-model"), "unknown-model");
    }
}
