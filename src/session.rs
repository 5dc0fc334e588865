use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info};

use crate::client::ClientError;
use crate::holo::{self, UserInfo, VideoPage};
use crate::storage::TokenUpdate;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("not logged in")]
    NotLoggedIn,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct State {
    pub logged_in: bool,
    pub next_cursor: Option<String>,
    pub loading: bool,
}

#[derive(Debug)]
pub enum LoginCheck {
    /// No access token is stored.
    NoToken,
    Active(UserInfo),
    /// A token was stored but the backend rejected it or the call failed.
    Expired(ClientError),
}

/// Dashboard state over the backend API: login status, pagination cursor,
/// and the advisory busy flag for paginated loads.
pub struct Manager {
    api: Arc<holo::Client>,
    state: RwLock<State>,
}

struct LoadingGuard<'a> {
    state: &'a RwLock<State>,
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.state.write().loading = false;
    }
}

impl Manager {
    pub fn new(api: Arc<holo::Client>) -> Self {
        let logged_in = api.http().credentials().access_token().is_some();
        Self {
            api,
            state: RwLock::new(State {
                logged_in,
                ..State::default()
            }),
        }
    }

    pub fn api(&self) -> &holo::Client {
        &self.api
    }

    pub fn state(&self) -> State {
        self.state.read().clone()
    }

    pub fn is_logged_in(&self) -> bool {
        self.state.read().logged_in
    }

    pub fn check_login(&self) -> LoginCheck {
        let has_token = self.api.http().credentials().access_token().is_some();
        self.state.write().logged_in = has_token;
        if !has_token {
            return LoginCheck::NoToken;
        }

        match self.api.me() {
            Ok(user) => {
                self.state.write().logged_in = true;
                LoginCheck::Active(user)
            }
            Err(err) => {
                debug!(error = %err, "login check failed");
                self.state.write().logged_in = false;
                LoginCheck::Expired(err)
            }
        }
    }

    /// Stores manually supplied tokens; blank values leave the stored ones
    /// untouched. Returns whether an access token is now present.
    pub fn save_tokens(&self, access: &str, refresh: &str) -> Result<bool> {
        let update = TokenUpdate {
            access_token: Some(access.trim().to_string()),
            refresh_token: Some(refresh.trim().to_string()),
            subject_id: None,
        };
        self.api
            .http()
            .credentials()
            .set_tokens(&update)
            .context("save tokens")?;
        let logged_in = self.api.http().credentials().access_token().is_some();
        self.state.write().logged_in = logged_in;
        info!(logged_in, "tokens saved");
        Ok(logged_in)
    }

    pub fn clear_tokens(&self) -> Result<()> {
        self.api
            .http()
            .credentials()
            .clear()
            .context("clear tokens")?;
        let mut state = self.state.write();
        state.logged_in = false;
        state.next_cursor = None;
        Ok(())
    }

    /// Clears local credentials first, then tells the backend.
    pub fn logout(&self) -> Result<()> {
        self.clear_tokens()?;
        self.api.logout();
        Ok(())
    }

    /// Starts pagination from a cursor obtained earlier.
    pub fn resume_from(&self, cursor: Option<String>) {
        self.state.write().next_cursor = cursor.filter(|c| !c.is_empty());
    }

    /// Loads the first or the next page of videos. Returns `Ok(None)` when a
    /// load is already in flight.
    pub fn load_videos(&self, first_page: bool, max_count: u32) -> Result<Option<VideoPage>> {
        if !self.is_logged_in() {
            return Err(SessionError::NotLoggedIn.into());
        }
        let cursor = {
            let mut state = self.state.write();
            if state.loading {
                return Ok(None);
            }
            state.loading = true;
            if first_page {
                state.next_cursor = None;
            }
            state.next_cursor.clone()
        };
        let _guard = LoadingGuard { state: &self.state };

        let max_count = if max_count == 0 {
            holo::DEFAULT_PAGE_SIZE
        } else {
            max_count
        };
        let page = self
            .api
            .list_videos(max_count, cursor.as_deref())
            .context("load videos")?;
        self.state.write().next_cursor = page.next_cursor().map(str::to_string);
        Ok(Some(page))
    }

    pub fn query_videos(&self, video_ids: &[String]) -> Result<Value> {
        if !self.is_logged_in() {
            return Err(SessionError::NotLoggedIn.into());
        }
        self.api.query_videos(video_ids).context("query videos")
    }

    /// One-line summary of the session, token values excluded.
    pub fn status_line(&self) -> String {
        let state = self.state();
        let pair = self.api.http().credentials().pair();
        let yes_no = |present: bool| if present { "yes" } else { "no" };
        format!(
            "loggedIn={} access={} refresh={} loading={} cursor={}",
            state.logged_in,
            yes_no(pair.access_token.is_some()),
            yes_no(pair.refresh_token.is_some()),
            state.loading,
            state.next_cursor.as_deref().unwrap_or("-"),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::client::{AuthenticatedClient, ClientConfig};
    use crate::storage::CredentialStore;
    use crate::testing::{Backend, Reply};

    fn manager(base_url: &str, access: Option<&str>, refresh: Option<&str>) -> Manager {
        let credentials = CredentialStore::in_memory();
        credentials
            .set_tokens(&TokenUpdate {
                access_token: access.map(Into::into),
                refresh_token: refresh.map(Into::into),
                subject_id: None,
            })
            .unwrap();
        let http = AuthenticatedClient::new(
            credentials,
            ClientConfig {
                user_agent: "holo-test/0.1".into(),
                base_url: Some(base_url.to_string()),
                timeout: Some(Duration::from_secs(5)),
                http_client: None,
            },
        )
        .unwrap();
        Manager::new(Arc::new(holo::Client::new(Arc::new(http))))
    }

    #[test]
    fn check_login_without_token_skips_backend() {
        let session = manager(crate::testing::closed_base_url().as_str(), None, None);
        assert!(matches!(session.check_login(), LoginCheck::NoToken));
        assert!(!session.is_logged_in());
    }

    #[test]
    fn check_login_refreshes_expired_token() {
        let backend = Backend::serve(vec![
            Reply::json(401, "{}"),
            Reply::json(200, r#"{"access_token":"A2"}"#),
            Reply::json(200, r#"{"data":{"user":{"display_name":"X"}}}"#),
        ]);
        let session = manager(&backend.base_url, Some("A1"), Some("R1"));

        match session.check_login() {
            LoginCheck::Active(user) => assert_eq!(user.display_name.as_deref(), Some("X")),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(
            session.status_line(),
            "loggedIn=true access=yes refresh=yes loading=false cursor=-"
        );
    }

    #[test]
    fn check_login_marks_expired_session() {
        let backend = Backend::serve(vec![
            Reply::json(401, "{}"),
            Reply::json(403, "{}"),
        ]);
        let session = manager(&backend.base_url, Some("A1"), Some("R1"));

        assert!(matches!(
            session.check_login(),
            LoginCheck::Expired(ClientError::Unauthorized)
        ));
        assert!(!session.is_logged_in());
        assert!(session.api().http().credentials().pair().is_empty());
    }

    #[test]
    fn pagination_keeps_cursor_only_while_more_pages_exist() {
        let backend = Backend::serve(vec![
            Reply::json(
                200,
                r#"{"data":{"videos":[{"id":"v1"}],"has_more":true,"cursor":"c1"}}"#,
            ),
            Reply::json(
                200,
                r#"{"data":{"videos":[{"id":"v2"}],"has_more":false,"cursor":"c2"}}"#,
            ),
        ]);
        let session = manager(&backend.base_url, Some("A1"), None);

        let first = session.load_videos(true, 5).unwrap().unwrap();
        assert_eq!(first.videos[0].id.as_deref(), Some("v1"));
        assert_eq!(session.state().next_cursor.as_deref(), Some("c1"));

        session.load_videos(false, 5).unwrap().unwrap();
        assert_eq!(session.state().next_cursor, None);
        assert!(!session.state().loading);

        let second: Value = serde_json::from_str(&backend.seen()[1].body).unwrap();
        assert_eq!(second["cursor"], "c1");
    }

    #[test]
    fn load_is_skipped_while_busy() {
        let session = manager(crate::testing::closed_base_url().as_str(), Some("A1"), None);
        session.state.write().loading = true;

        assert!(session.load_videos(true, 5).unwrap().is_none());
    }

    #[test]
    fn failed_load_clears_busy_flag() {
        let session = manager(crate::testing::closed_base_url().as_str(), Some("A1"), None);

        assert!(session.load_videos(true, 5).is_err());
        assert!(!session.state().loading);
    }

    #[test]
    fn load_requires_login() {
        let session = manager(crate::testing::closed_base_url().as_str(), None, None);
        let err = session.load_videos(true, 5).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SessionError>(),
            Some(SessionError::NotLoggedIn)
        ));
    }

    #[test]
    fn save_and_clear_tokens_track_login_state() {
        let session = manager(crate::testing::closed_base_url().as_str(), None, None);

        assert!(session.save_tokens("  A1 ", "").unwrap());
        assert_eq!(
            session.api().http().credentials().access_token().as_deref(),
            Some("A1")
        );
        assert!(session.api().http().credentials().refresh_token().is_none());

        session.clear_tokens().unwrap();
        session.clear_tokens().unwrap();
        assert!(!session.is_logged_in());
    }
}
