use crate::error::Result;
use crate::types::{Server, User};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

/// One subscription output format. Implementations declare the flag tokens
/// they answer to and turn the filtered server list into the response body.
pub trait Renderer: Send + Sync {
    fn name(&self) -> &'static str;
    /// Tokens matched case-insensitively as substrings of the client flag.
    fn flags(&self) -> &[&str];
    fn render(&self, user: &User, servers: &[Server]) -> Result<String>;
}

pub struct Rendered {
    pub renderer: &'static str,
    pub body: String,
}

/// Startup-time renderer registry. Dispatch is an ordered linear scan:
/// registration order is priority order, and the general-purpose fallback
/// answers when nothing matches or no flag was supplied.
pub struct RendererRegistry {
    renderers: Vec<Box<dyn Renderer>>,
    fallback: Box<dyn Renderer>,
}

impl RendererRegistry {
    pub fn new() -> Self {
        Self {
            renderers: Vec::new(),
            fallback: Box::new(GeneralRenderer),
        }
    }

    pub fn register(&mut self, renderer: Box<dyn Renderer>) {
        self.renderers.push(renderer);
    }

    pub fn dispatch(&self, flag: &str, user: &User, servers: &[Server]) -> Result<Rendered> {
        if !flag.is_empty() {
            let flag_lower = flag.to_lowercase();
            for renderer in &self.renderers {
                let matched = renderer
                    .flags()
                    .iter()
                    .any(|token| flag_lower.contains(&token.to_lowercase()));
                if matched {
                    return Ok(Rendered {
                        renderer: renderer.name(),
                        body: renderer.render(user, servers)?,
                    });
                }
            }
        }

        Ok(Rendered {
            renderer: self.fallback.name(),
            body: self.fallback.render(user, servers)?,
        })
    }
}

impl Default for RendererRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Fallback renderer: one line per server, base64-encoded as subscription
/// clients conventionally expect. Protocol-specific formats plug in as
/// registered renderers.
pub struct GeneralRenderer;

impl Renderer for GeneralRenderer {
    fn name(&self) -> &'static str {
        "general"
    }

    fn flags(&self) -> &[&str] {
        &[]
    }

    fn render(&self, _user: &User, servers: &[Server]) -> Result<String> {
        let lines: Vec<String> = servers
            .iter()
            .map(|s| format!("{}://{}:{}#{}", s.kind.as_str(), s.host, s.port, s.name))
            .collect();
        Ok(BASE64.encode(lines.join("\n")))
    }
}
