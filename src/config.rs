//! Configuração do dossier carregada a partir de `dossier.toml`.
//!
//! A struct [`DossierConfig`] contém todos os parâmetros configuráveis, com as
//! tabelas `[gate]` e `[verification]` para a resiliência das chamadas e o
//! laço de verificação. Valores não presentes no arquivo usam defaults.
//! A variável de ambiente `ANTHROPIC_API_KEY` tem precedência sobre o arquivo.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Configuração de nível superior carregada de `dossier.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct DossierConfig {
    /// Chave da API Anthropic.
    #[serde(default)]
    pub api_key: String,

    /// Identificador do modelo usado em todas as chamadas.
    #[serde(default = "default_model")]
    pub model: String,

    /// Limite de tokens por resposta.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Diretório onde jobs e relatórios são gravados.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Tentativas de geração do rascunho antes de rejeitar o job.
    #[serde(default = "default_generation_attempts")]
    pub generation_attempts: u32,

    #[serde(default)]
    pub gate: GateConfig,

    #[serde(default)]
    pub verification: VerificationConfig,
}

/// Parâmetros do portão de chamadas: retentativas, backoff e concorrência.
#[derive(Debug, Clone, Deserialize)]
pub struct GateConfig {
    /// Tentativas por chamada, incluindo a primeira.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Atraso base em milissegundos para backoff exponencial.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Teto do atraso entre tentativas.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Chamadas simultâneas permitidas no modo normal.
    #[serde(default = "default_normal_permits")]
    pub normal_permits: usize,

    /// Chamadas simultâneas permitidas no modo degradado.
    #[serde(default = "default_degraded_permits")]
    pub degraded_permits: usize,

    /// Falhas consecutivas por rate limit que disparam o modo degradado.
    #[serde(default = "default_degrade_threshold")]
    pub degrade_threshold: u32,
}

/// Parâmetros do laço avaliador/refinador.
#[derive(Debug, Clone, Deserialize)]
pub struct VerificationConfig {
    #[serde(default = "default_max_loops")]
    pub max_loops: u32,

    /// Caminhos de seção avaliados (ex.: "swot.strengths"). Vazio = todos.
    #[serde(default)]
    pub scope: Vec<String>,

    /// Valores mais curtos que isto não são avaliados.
    #[serde(default = "default_min_field_chars")]
    pub min_field_chars: usize,
}

fn default_model() -> String {
    "claude-sonnet-4-5-20250929".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".dossier")
}

fn default_generation_attempts() -> u32 {
    3
}

fn default_max_attempts() -> u32 {
    5
}

// 2s, 4s, 8s, 16s, limitado a 30s.
fn default_base_delay_ms() -> u64 {
    2000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_normal_permits() -> usize {
    5
}

fn default_degraded_permits() -> usize {
    1
}

fn default_degrade_threshold() -> u32 {
    3
}

fn default_max_loops() -> u32 {
    2
}

fn default_min_field_chars() -> usize {
    12
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            normal_permits: default_normal_permits(),
            degraded_permits: default_degraded_permits(),
            degrade_threshold: default_degrade_threshold(),
        }
    }
}

impl GateConfig {
    /// Atraso antes da tentativa seguinte a `attempt` (1-based):
    /// `min(base * 2^(attempt-1), max)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        self.base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms)
    }
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            max_loops: default_max_loops(),
            scope: Vec::new(),
            min_field_chars: default_min_field_chars(),
        }
    }
}

impl Default for DossierConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            data_dir: default_data_dir(),
            generation_attempts: default_generation_attempts(),
            gate: GateConfig::default(),
            verification: VerificationConfig::default(),
        }
    }
}

impl DossierConfig {
    /// Carrega a configuração de `dossier.toml` no diretório atual.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("dossier.toml"))
    }

    /// Carrega a configuração de um caminho explícito.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str::<DossierConfig>(&contents)
                .with_context(|| format!("invalid config in {}", path.display()))?
        } else {
            Self::default()
        };

        // Variável de ambiente tem precedência sobre o arquivo para a chave API.
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY")
            && !key.is_empty()
        {
            config.api_key = key;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = DossierConfig::default();
        assert_eq!(config.generation_attempts, 3);
        assert_eq!(config.gate.max_attempts, 5);
        assert_eq!(config.gate.normal_permits, 5);
        assert_eq!(config.gate.degraded_permits, 1);
        assert_eq!(config.gate.degrade_threshold, 3);
        assert_eq!(config.verification.max_loops, 2);
        assert!(config.verification.scope.is_empty());
    }

    #[test]
    fn deserialize_partial_toml_with_tables() {
        let toml_str = r#"
            model = "claude-haiku-4-5-20251001"

            [gate]
            max_attempts = 2

            [verification]
            scope = ["swot.strengths", "overview.summary"]
        "#;
        let config: DossierConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.model, "claude-haiku-4-5-20251001");
        assert_eq!(config.gate.max_attempts, 2);
        assert_eq!(config.gate.base_delay_ms, 2000);
        assert_eq!(config.verification.scope.len(), 2);
        assert_eq!(config.verification.max_loops, 2);
        assert_eq!(config.max_tokens, 4096);
    }

    #[test]
    fn backoff_doubles_and_caps_at_thirty_seconds() {
        let gate = GateConfig::default();
        assert_eq!(gate.delay_for_attempt(1), 2000);
        assert_eq!(gate.delay_for_attempt(2), 4000);
        assert_eq!(gate.delay_for_attempt(3), 8000);
        assert_eq!(gate.delay_for_attempt(4), 16_000);
        assert_eq!(gate.delay_for_attempt(5), 30_000);
        assert_eq!(gate.delay_for_attempt(40), 30_000);
    }

    #[test]
    fn load_from_file_reads_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dossier.toml");
        std::fs::write(&path, "generation_attempts = 4\n").unwrap();
        let config = DossierConfig::load_from(&path).unwrap();
        assert_eq!(config.generation_attempts, 4);
    }

    #[test]
    fn load_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = DossierConfig::load_from(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(config.verification.max_loops, 2);
    }
}
