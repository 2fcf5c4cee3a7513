pub mod gotrue;
pub mod memory;

use std::sync::Arc;
use std::time::Duration;
use tally_core::{Clock, IdentityBackend};
use tracing::info;

use crate::config::{IdentityMode, IdentitySection};

pub use gotrue::GoTrueBackend;
pub use memory::{MemoryBackend, MEMORY_SESSION_COOKIE};

pub fn build_backend(
    section: &IdentitySection,
    secure_cookies: bool,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<Arc<dyn IdentityBackend>> {
    match section.mode {
        IdentityMode::Memory => {
            let backend = MemoryBackend::new(clock, Duration::from_secs(section.session_rotate_secs))
                .with_secure_cookies(secure_cookies);
            for user in &section.users {
                backend.add_user(&user.email, &user.password);
            }
            info!(
                event = "identity_backend",
                mode = "memory",
                users = section.users.len()
            );
            Ok(Arc::new(backend))
        }
        IdentityMode::Gotrue => {
            let backend = GoTrueBackend::new(
                &section.url,
                &section.anon_key,
                &section.project_ref,
                Duration::from_millis(section.timeout_ms),
                clock,
            )?
            .with_secure_cookies(secure_cookies);
            info!(
                event = "identity_backend",
                mode = "gotrue",
                url = %section.url,
                session_cookie = backend.session_cookie_name()
            );
            Ok(Arc::new(backend))
        }
    }
}
