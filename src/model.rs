//! model.rs
//!
//! Pretrained GPT-2 style backend: a Hugging Face `tokenizer.json` plus an ONNX export of
//! the decoder, run with ONNX Runtime.
//!
//! Files come either from a local directory or from the Hugging Face Hub by repository
//! name (default `gpt2`). The hub client caches downloads, so only the first run fetches.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use ndarray::{s, Array2, Ix3};
use ort::session::Session;
use ort::value::TensorRef;
use tracing::{debug, info};

use crate::error::LyrgenError;
use crate::generator::{generation_limit, sample_until, LanguageModel, LyricGenerator, TextTokenizer};
use crate::sampling::Sampler;

pub const DEFAULT_MODEL: &str = "gpt2";
pub const DEFAULT_ONNX_FILE: &str = "onnx/decoder_model.onnx";
pub const TOKENIZER_FILE: &str = "tokenizer.json";
/// GPT-2 learned position embeddings
pub const GPT2_CONTEXT: usize = 1024;
const EOS_TOKEN: &str = "<|endoftext|>";

pub type HfLyricGenerator = LyricGenerator<HfTokenizer, OnnxLanguageModel>;

/// Where to find the tokenizer and the ONNX graph.
#[derive(Clone, Debug)]
pub struct ModelSource {
    /// Hub repository id, used when `local_dir` is unset
    pub name: String,
    pub local_dir: Option<PathBuf>,
    /// ONNX graph path relative to the repository / directory root
    pub onnx_file: String,
    pub context_len: usize,
}

impl Default for ModelSource {
    fn default() -> Self {
        Self {
            name: DEFAULT_MODEL.to_string(),
            local_dir: None,
            onnx_file: DEFAULT_ONNX_FILE.to_string(),
            context_len: GPT2_CONTEXT,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModelFiles {
    pub tokenizer: PathBuf,
    pub onnx: PathBuf,
}

impl ModelSource {
    pub fn resolve(&self) -> Result<ModelFiles> {
        match &self.local_dir {
            Some(dir) => Ok(ModelFiles {
                tokenizer: existing(dir.join(TOKENIZER_FILE))?,
                onnx: existing(dir.join(&self.onnx_file))?,
            }),
            None => self.fetch(),
        }
    }

    fn fetch(&self) -> Result<ModelFiles> {
        use hf_hub::api::sync::Api;

        let api = Api::new().context("initialising Hugging Face Hub client")?;
        let repo = api.model(self.name.clone());
        let get = |file: &str| {
            repo.get(file).with_context(|| format!("fetching {} from {}", file, self.name))
        };
        Ok(ModelFiles { tokenizer: get(TOKENIZER_FILE)?, onnx: get(&self.onnx_file)? })
    }
}

fn existing(path: PathBuf) -> Result<PathBuf> {
    if !path.is_file() {
        bail!("model file not found: {:?}", path);
    }
    Ok(path)
}

/// Resolve, download if needed, and load a ready generator.
pub fn load_generator(source: &ModelSource) -> Result<HfLyricGenerator> {
    info!(model = %source.name, dir = ?source.local_dir, "loading language model");
    let files = source.resolve()?;
    let tokenizer = HfTokenizer::from_file(&files.tokenizer)?;
    let model = OnnxLanguageModel::load(&files.onnx, source.context_len)?;
    Ok(LyricGenerator::new(tokenizer, model))
}

pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
    eos: Option<u32>,
}

impl HfTokenizer {
    pub fn from_file(path: &Path) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| LyrgenError::Tokenizer(format!("loading {:?}: {e}", path)))?;
        let eos = inner.token_to_id(EOS_TOKEN);
        debug!(vocab = inner.get_vocab_size(true), eos = ?eos, "tokenizer ready");
        Ok(Self { inner, eos })
    }
}

impl TextTokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let enc = self
            .inner
            .encode(text, false)
            .map_err(|e| LyrgenError::Tokenizer(format!("encoding: {e}")))?;
        Ok(enc.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.inner
            .decode(ids, skip_special_tokens)
            .map_err(|e| LyrgenError::Tokenizer(format!("decoding: {e}")).into())
    }

    fn eos_token_id(&self) -> Option<u32> {
        self.eos
    }
}

/// A decoder graph taking `input_ids` and `attention_mask` (and `position_ids` when the
/// export asks for it) and returning `logits` of shape [batch, seq, vocab].
pub struct OnnxLanguageModel {
    session: Session,
    wants_position_ids: bool,
    context_len: usize,
}

impl OnnxLanguageModel {
    pub fn load(path: &Path, context_len: usize) -> Result<Self> {
        let session = Session::builder()?
            .commit_from_file(path)
            .with_context(|| format!("loading ONNX model {:?}", path))?;
        let wants_position_ids = session.inputs.iter().any(|i| i.name == "position_ids");
        debug!(path = ?path, wants_position_ids, "ONNX session ready");
        Ok(Self { session, wants_position_ids, context_len })
    }

    /// Logits for the position following the last id.
    fn next_logits(&mut self, ids: &[u32]) -> Result<Vec<f32>> {
        let n = ids.len();
        let input_ids = Array2::<i64>::from_shape_vec((1, n), ids.iter().map(|&i| i as i64).collect())
            .context("input_ids shape")?;
        let attention_mask = Array2::<i64>::ones((1, n));
        let position_ids = Array2::<i64>::from_shape_vec((1, n), (0..n as i64).collect())
            .context("position_ids shape")?;

        let mut inputs = ort::inputs![
            "input_ids" => TensorRef::from_array_view(&input_ids)?,
            "attention_mask" => TensorRef::from_array_view(&attention_mask)?,
        ];
        if self.wants_position_ids {
            inputs.push(("position_ids".into(), TensorRef::from_array_view(&position_ids)?.into()));
        }

        let outputs = self.session.run(inputs)?;
        let logits = outputs
            .get("logits")
            .ok_or(LyrgenError::MissingLogits)?
            .try_extract_array::<f32>()?;
        let logits = logits.into_dimensionality::<Ix3>().context("logits should be [batch, seq, vocab]")?;
        let t = logits.shape()[1];
        if t == 0 {
            return Err(LyrgenError::MissingLogits.into());
        }
        Ok(logits.slice(s![0, t - 1, ..]).to_vec())
    }
}

impl LanguageModel for OnnxLanguageModel {
    fn generate(
        &mut self,
        input_ids: &[u32],
        max_len: usize,
        eos: Option<u32>,
        sampler: &mut Sampler,
    ) -> Result<Vec<u32>> {
        let limit = generation_limit(input_ids.len(), max_len, self.context_len)?;
        sample_until(input_ids, limit, eos, sampler, |ids| self.next_logits(ids))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const WORD_LEVEL: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [
            {"id": 0, "content": "<|endoftext|>", "single_word": false, "lstrip": false,
             "rstrip": false, "normalized": false, "special": true}
        ],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": {"<|endoftext|>": 0, "hello": 1, "world": 2, "[UNK]": 3},
            "unk_token": "[UNK]"
        }
    }"#;

    #[test]
    fn local_dir_requires_both_files() {
        let dir = tempdir().unwrap();
        let source = ModelSource { local_dir: Some(dir.path().to_path_buf()), ..ModelSource::default() };
        let err = source.resolve().unwrap_err();
        assert!(err.to_string().contains(TOKENIZER_FILE));

        std::fs::write(dir.path().join(TOKENIZER_FILE), WORD_LEVEL).unwrap();
        let err = source.resolve().unwrap_err();
        assert!(err.to_string().contains("decoder_model.onnx"));

        std::fs::create_dir_all(dir.path().join("onnx")).unwrap();
        std::fs::write(dir.path().join(DEFAULT_ONNX_FILE), b"").unwrap();
        let files = source.resolve().unwrap();
        assert_eq!(files.onnx, dir.path().join(DEFAULT_ONNX_FILE));
    }

    #[test]
    fn hf_tokenizer_round_trips_and_finds_eos() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(TOKENIZER_FILE);
        std::fs::write(&path, WORD_LEVEL).unwrap();

        let tok = HfTokenizer::from_file(&path).unwrap();
        assert_eq!(tok.eos_token_id(), Some(0));
        assert_eq!(tok.encode("hello world").unwrap(), vec![1, 2]);
        assert_eq!(tok.decode(&[1, 2, 0], true).unwrap(), "hello world");
    }

    #[test]
    fn broken_tokenizer_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(TOKENIZER_FILE);
        std::fs::write(&path, "{ not json").unwrap();
        let err = HfTokenizer::from_file(&path).err().unwrap();
        assert!(matches!(err.downcast_ref::<LyrgenError>(), Some(LyrgenError::Tokenizer(_))));
    }
}
