//! Llama-2 style decoder over libtorch.
//!
//! Parameter paths follow the training code's naming
//! (`layers.{i}.attention.wq.weight`, `tok_embeddings.weight`, ...) so
//! checkpoints bind by name. Kernels are libtorch's; this module only wires
//! the layers.

use tch::{
    Device, Kind, Tensor,
    nn::{self, Module},
};

use crate::{
    error::ServiceError,
    model::{LanguageModel, ModelConfig},
};

fn no_bias() -> nn::LinearConfig {
    nn::LinearConfig {
        bias: false,
        ..Default::default()
    }
}

struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    fn new(vs: nn::Path, size: i64, eps: f64) -> Self {
        Self {
            weight: vs.ones("weight", &[size]),
            eps,
        }
    }
}

impl Module for RmsNorm {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let norm_xs = (xs * xs).mean_dim(-1, true, Kind::Float);
        let xs_normed = xs * (norm_xs + self.eps).rsqrt();
        xs_normed * &self.weight
    }
}

struct Attention {
    wq: nn::Linear,
    wk: nn::Linear,
    wv: nn::Linear,
    wo: nn::Linear,
    n_heads: i64,
    n_kv_heads: i64,
    head_dim: i64,
}

impl Attention {
    fn new(vs: nn::Path, config: &ModelConfig) -> Self {
        let dim = config.dim as i64;
        let head_dim = config.head_dim() as i64;
        let kv_dim = config.n_kv_heads as i64 * head_dim;
        Self {
            wq: nn::linear(&vs / "wq", dim, dim, no_bias()),
            wk: nn::linear(&vs / "wk", dim, kv_dim, no_bias()),
            wv: nn::linear(&vs / "wv", dim, kv_dim, no_bias()),
            wo: nn::linear(&vs / "wo", dim, dim, no_bias()),
            n_heads: config.n_heads as i64,
            n_kv_heads: config.n_kv_heads as i64,
            head_dim,
        }
    }

    fn forward(&self, xs: &Tensor, rope: &Rope, mask: &Tensor) -> Tensor {
        let size = xs.size();
        let (b, t, c) = (size[0], size[1], size[2]);

        let q = self.wq.forward(xs).reshape([b, t, self.n_heads, self.head_dim]);
        let k = self.wk.forward(xs).reshape([b, t, self.n_kv_heads, self.head_dim]);
        let v = self.wv.forward(xs).reshape([b, t, self.n_kv_heads, self.head_dim]);

        let q = rope.apply(&q, t);
        let k = rope.apply(&k, t);

        let n_rep = self.n_heads / self.n_kv_heads;
        let k = repeat_kv(&k, n_rep);
        let v = repeat_kv(&v, n_rep);

        let q = q.transpose(1, 2);
        let k = k.transpose(1, 2);
        let v = v.transpose(1, 2);

        let att = q.matmul(&k.transpose(-2, -1)) / (self.head_dim as f64).sqrt();
        let att = att.masked_fill(mask, f64::NEG_INFINITY);
        let y = att.softmax(-1, Kind::Float).matmul(&v);
        let y = y.transpose(1, 2).contiguous().reshape([b, t, c]);
        self.wo.forward(&y)
    }
}

fn repeat_kv(xs: &Tensor, n_rep: i64) -> Tensor {
    if n_rep == 1 {
        return xs.shallow_clone();
    }
    let size = xs.size();
    let (b, t, n_kv, hd) = (size[0], size[1], size[2], size[3]);
    xs.unsqueeze(3)
        .expand([b, t, n_kv, n_rep, hd], false)
        .reshape([b, t, n_kv * n_rep, hd])
}

struct FeedForward {
    w1: nn::Linear,
    w2: nn::Linear,
    w3: nn::Linear,
}

impl FeedForward {
    fn new(vs: nn::Path, config: &ModelConfig) -> Self {
        let dim = config.dim as i64;
        let hidden = config.hidden_dim() as i64;
        Self {
            w1: nn::linear(&vs / "w1", dim, hidden, no_bias()),
            w2: nn::linear(&vs / "w2", hidden, dim, no_bias()),
            w3: nn::linear(&vs / "w3", dim, hidden, no_bias()),
        }
    }
}

impl Module for FeedForward {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let gate = self.w1.forward(xs).silu();
        self.w2.forward(&(gate * self.w3.forward(xs)))
    }
}

struct Block {
    attention_norm: RmsNorm,
    attention: Attention,
    ffn_norm: RmsNorm,
    feed_forward: FeedForward,
}

impl Block {
    fn new(vs: nn::Path, config: &ModelConfig) -> Self {
        let dim = config.dim as i64;
        Self {
            attention_norm: RmsNorm::new(&vs / "attention_norm", dim, config.norm_eps),
            attention: Attention::new(&vs / "attention", config),
            ffn_norm: RmsNorm::new(&vs / "ffn_norm", dim, config.norm_eps),
            feed_forward: FeedForward::new(&vs / "feed_forward", config),
        }
    }

    fn forward(&self, xs: &Tensor, rope: &Rope, mask: &Tensor) -> Tensor {
        let h = xs + self.attention.forward(&self.attention_norm.forward(xs), rope, mask);
        &h + self.feed_forward.forward(&self.ffn_norm.forward(&h))
    }
}

/// Precomputed rotary tables, shape `[max_seq_len, head_dim / 2]`.
struct Rope {
    cos: Tensor,
    sin: Tensor,
}

impl Rope {
    fn new(config: &ModelConfig, device: Device) -> Self {
        let head_dim = config.head_dim() as i64;
        let exponents = Tensor::arange_start_step(0, head_dim, 2, (Kind::Float, device))
            / head_dim as f64;
        let inv_freq = (exponents * -config.rope_theta.ln()).exp();
        let positions = Tensor::arange(config.max_seq_len as i64, (Kind::Float, device));
        let freqs = positions.unsqueeze(1) * inv_freq.unsqueeze(0);
        Self {
            cos: freqs.cos(),
            sin: freqs.sin(),
        }
    }

    /// Rotates interleaved (even, odd) pairs of `xs: [b, t, heads, head_dim]`.
    fn apply(&self, xs: &Tensor, t: i64) -> Tensor {
        let size = xs.size();
        let (b, heads, hd) = (size[0], size[2], size[3]);
        let pairs = xs.reshape([b, t, heads, hd / 2, 2]);
        let re = pairs.select(-1, 0);
        let im = pairs.select(-1, 1);
        let cos = self.cos.narrow(0, 0, t).reshape([1, t, 1, hd / 2]);
        let sin = self.sin.narrow(0, 0, t).reshape([1, t, 1, hd / 2]);
        let out_re = &re * &cos - &im * &sin;
        let out_im = &re * &sin + &im * &cos;
        Tensor::stack(&[out_re, out_im], -1).flatten(3, -1)
    }
}

pub struct Transformer {
    vs: nn::VarStore,
    config: ModelConfig,
    tok_embeddings: nn::Embedding,
    layers: Vec<Block>,
    norm: RmsNorm,
    output: nn::Linear,
    rope: Rope,
    device: Device,
}

impl Transformer {
    /// Builds a randomly initialized model on `device`.
    pub fn new(config: &ModelConfig, device: Device) -> Result<Self, ServiceError> {
        config.validate()?;
        let vs = nn::VarStore::new(device);
        let root = vs.root();
        let dim = config.dim as i64;
        let vocab = config.vocab_size as i64;

        let tok_embeddings =
            nn::embedding(&root / "tok_embeddings", vocab, dim, Default::default());
        let layers = (0..config.n_layers)
            .map(|i| Block::new(&root / "layers" / i, config))
            .collect();
        let norm = RmsNorm::new(&root / "norm", dim, config.norm_eps);
        let output = nn::linear(&root / "output", dim, vocab, no_bias());
        let rope = Rope::new(config, device);

        Ok(Self {
            vs,
            config: config.clone(),
            tok_embeddings,
            layers,
            norm,
            output,
            rope,
            device,
        })
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    pub fn var_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.vs
    }

    /// Logits for the last position of `tokens: [1, t]`, shape `[vocab]`.
    fn forward_last(&self, tokens: &Tensor) -> Tensor {
        let t = tokens.size()[1];
        let mask = Tensor::ones([t, t], (Kind::Float, self.device))
            .tril(0)
            .reshape([1, 1, t, t])
            .eq(0.);

        let mut h = self.tok_embeddings.forward(tokens);
        for layer in &self.layers {
            h = layer.forward(&h, &self.rope, &mask);
        }
        let h = self.norm.forward(&h.select(1, -1));
        self.output.forward(&h).squeeze_dim(0)
    }
}

impl LanguageModel for Transformer {
    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn next_token_logits(&self, tokens: &[u32]) -> Result<Vec<f32>, ServiceError> {
        if tokens.is_empty() {
            return Err(ServiceError::Inference("empty input sequence".into()));
        }
        let window = tokens.len().saturating_sub(self.config.max_seq_len);
        let ids: Vec<i64> = tokens[window..].iter().map(|&id| id as i64).collect();

        let logits = tch::no_grad(|| {
            let input = Tensor::from_slice(&ids)
                .reshape([1, ids.len() as i64])
                .to(self.device);
            self.forward_last(&input)
                .to_kind(Kind::Float)
                .to_device(Device::Cpu)
        });
        Ok(Vec::<f32>::try_from(&logits)?)
    }

    fn device(&self) -> String {
        match self.device {
            Device::Cuda(idx) => format!("cuda:{idx}"),
            other => format!("{other:?}").to_lowercase(),
        }
    }
}
