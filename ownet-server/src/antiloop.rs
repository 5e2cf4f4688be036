//! Loop detection for federated servers.
//!
//! Every server process draws one random token at start-up. A request that already
//! carries it has passed through this process before and is refused.
use ownet_protocol::AntiLoopToken;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct TokenSet {
    local: AntiLoopToken,
}

impl TokenSet {
    /// A token set with a freshly generated local token.
    pub fn generate() -> TokenSet {
        TokenSet::with_token(AntiLoopToken::new(*Uuid::new_v4().as_bytes()))
    }

    pub fn with_token(local: AntiLoopToken) -> TokenSet {
        TokenSet { local }
    }

    pub fn local(&self) -> AntiLoopToken {
        self.local
    }

    /// Whether a request carrying `tokens` already passed through this process.
    pub fn has_visited(&self, tokens: &[AntiLoopToken]) -> bool {
        tokens.contains(&self.local)
    }

    /// Tokens to attach when a request is forwarded to another server. The list only
    /// grows: every forwarding hop appends its own token.
    pub fn outbound(&self, inbound: &[AntiLoopToken]) -> Vec<AntiLoopToken> {
        let mut tokens = inbound.to_vec();
        tokens.push(self.local);
        tokens
    }
}
