use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tally_core::presence::encode_signal;
use tally_core::{CookieInstruction, GuardPolicy, IdentityError, ManualClock, User};
use tally_presence::boot::{ACTIVE_FLAG_KEY, LAST_BEAT_KEY};
use tally_presence::{
    ActivityKind, ActivitySource, AuthClient, BootOutcome, BrowserContext, ListenerId, Navigation,
    NavigationType, Notice, Notifier, PresenceMonitor, RenderGate, ScriptCookies, TabStorage,
};
use tokio::sync::mpsc;

const T0: i64 = 1_767_225_600_000;

#[derive(Default)]
struct FakeBrowser {
    storage: Mutex<HashMap<String, String>>,
    cookies: Mutex<HashMap<String, String>>,
    cookie_writes: Mutex<Vec<CookieInstruction>>,
    navigation: Mutex<Option<NavigationType>>,
    hard_redirects: Mutex<Vec<String>>,
    pushes: Mutex<Vec<String>>,
    notices: Mutex<Vec<Notice>>,
    listeners: Mutex<BTreeMap<ListenerId, (ActivityKind, mpsc::UnboundedSender<ActivityKind>)>>,
    next_listener: AtomicU64,
    user: Mutex<Option<User>>,
    user_lookup_fails: Mutex<bool>,
    sign_out_fails: Mutex<bool>,
    sign_out_calls: AtomicUsize,
}

impl FakeBrowser {
    fn signed_in() -> Arc<Self> {
        let browser = Arc::new(Self::default());
        *browser.user.lock().unwrap() = Some(User {
            id: "user-1".to_string(),
            email: Some("kim@example.com".to_string()),
        });
        browser
    }

    fn context(self: &Arc<Self>, clock: Arc<ManualClock>) -> BrowserContext {
        BrowserContext {
            storage: self.clone(),
            cookies: self.clone(),
            navigation: self.clone(),
            notifier: self.clone(),
            activity: self.clone(),
            auth: self.clone(),
            clock,
        }
    }

    fn with_storage(&self, key: &str, value: &str) {
        self.storage
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
    }

    fn with_cookie(&self, name: &str, value: &str) {
        self.cookies
            .lock()
            .unwrap()
            .insert(name.to_string(), value.to_string());
    }

    fn with_navigation(&self, navigation: NavigationType) {
        *self.navigation.lock().unwrap() = Some(navigation);
    }

    fn emit(&self, kind: ActivityKind) {
        for (registered, sink) in self.listeners.lock().unwrap().values() {
            if *registered == kind {
                let _ = sink.send(kind);
            }
        }
    }

    fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }

    fn sign_out_calls(&self) -> usize {
        self.sign_out_calls.load(Ordering::SeqCst)
    }

    fn signal_writes(&self) -> Vec<CookieInstruction> {
        self.cookie_writes
            .lock()
            .unwrap()
            .iter()
            .filter(|write| write.name == "session_presence")
            .cloned()
            .collect()
    }
}

impl TabStorage for FakeBrowser {
    fn get(&self, key: &str) -> Option<String> {
        self.storage.lock().unwrap().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.with_storage(key, value);
    }

    fn clear(&self) {
        self.storage.lock().unwrap().clear();
    }
}

impl ScriptCookies for FakeBrowser {
    fn get(&self, name: &str) -> Option<String> {
        self.cookies.lock().unwrap().get(name).cloned()
    }

    fn write(&self, instruction: &CookieInstruction) {
        let mut cookies = self.cookies.lock().unwrap();
        if instruction.options.max_age.is_some_and(|age| age <= 0) {
            cookies.remove(&instruction.name);
        } else {
            cookies.insert(instruction.name.clone(), instruction.value.clone());
        }
        self.cookie_writes.lock().unwrap().push(instruction.clone());
    }
}

impl Navigation for FakeBrowser {
    fn navigation_type(&self) -> Option<NavigationType> {
        *self.navigation.lock().unwrap()
    }

    fn hard_redirect(&self, path: &str) {
        self.hard_redirects.lock().unwrap().push(path.to_string());
    }

    fn push(&self, path: &str) {
        self.pushes.lock().unwrap().push(path.to_string());
    }
}

impl Notifier for FakeBrowser {
    fn notify(&self, notice: Notice) {
        self.notices.lock().unwrap().push(notice);
    }
}

impl ActivitySource for FakeBrowser {
    fn add_listener(
        &self,
        kind: ActivityKind,
        sink: mpsc::UnboundedSender<ActivityKind>,
    ) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::SeqCst));
        self.listeners.lock().unwrap().insert(id, (kind, sink));
        id
    }

    fn remove_listener(&self, id: ListenerId) {
        self.listeners.lock().unwrap().remove(&id);
    }
}

#[async_trait]
impl AuthClient for FakeBrowser {
    async fn current_user(&self) -> Result<Option<User>, IdentityError> {
        if *self.user_lookup_fails.lock().unwrap() {
            return Err(IdentityError::Unreachable("offline".to_string()));
        }
        Ok(self.user.lock().unwrap().clone())
    }

    async fn sign_out(&self) -> Result<(), IdentityError> {
        self.sign_out_calls.fetch_add(1, Ordering::SeqCst);
        if *self.sign_out_fails.lock().unwrap() {
            return Err(IdentityError::Unreachable("offline".to_string()));
        }
        *self.user.lock().unwrap() = None;
        Ok(())
    }
}

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(T0))
}

async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn fresh_tab_with_live_credentials_is_purged_before_render() {
    let browser = FakeBrowser::signed_in();
    browser.with_navigation(NavigationType::Navigate);
    browser.with_storage("draft", "half-typed expense");
    let mut monitor = PresenceMonitor::new(browser.context(clock()), GuardPolicy::default());
    let gate = monitor.render_gate();
    assert_eq!(*gate.borrow(), RenderGate::Checking);

    assert_eq!(monitor.mount().await, BootOutcome::Purged);

    assert_eq!(*gate.borrow(), RenderGate::Purged);
    assert_eq!(browser.sign_out_calls(), 1);
    assert_eq!(*browser.hard_redirects.lock().unwrap(), vec!["/login"]);
    assert_eq!(*browser.notices.lock().unwrap(), vec![Notice::SessionRestored]);
    assert_eq!(TabStorage::get(&*browser, "draft"), None);
    assert_eq!(
        TabStorage::get(&*browser, ACTIVE_FLAG_KEY).as_deref(),
        Some("checked")
    );
    assert!(!monitor.is_running());
    assert_eq!(browser.listener_count(), 0);
    let writes = browser.signal_writes();
    assert_eq!(writes.len(), 1, "only the deletion, never a heartbeat");
    assert_eq!(writes[0].options.max_age, Some(0));
}

#[tokio::test]
async fn double_mount_purges_once_even_when_revocation_fails() {
    let browser = FakeBrowser::signed_in();
    *browser.sign_out_fails.lock().unwrap() = true;
    let ctx = browser.context(clock());
    let mut first = PresenceMonitor::new(ctx.clone(), GuardPolicy::default());
    let mut second = PresenceMonitor::new(ctx, GuardPolicy::default());

    assert_eq!(first.mount().await, BootOutcome::Purged);
    first.unmount();
    assert_eq!(second.mount().await, BootOutcome::Passed);

    assert_eq!(browser.sign_out_calls(), 1);
    assert_eq!(browser.hard_redirects.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn reload_shortly_after_last_beat_passes() {
    let clock = clock();
    let browser = FakeBrowser::signed_in();
    browser.with_navigation(NavigationType::Reload);
    browser.with_storage(ACTIVE_FLAG_KEY, "checked");
    browser.with_storage(LAST_BEAT_KEY, &encode_signal(T0 - 8_000));
    let mut monitor = PresenceMonitor::new(browser.context(clock), GuardPolicy::default());

    assert_eq!(monitor.mount().await, BootOutcome::Passed);

    assert_eq!(monitor.current_gate(), RenderGate::Ready);
    assert_eq!(browser.sign_out_calls(), 0);
    assert!(browser.hard_redirects.lock().unwrap().is_empty());
    monitor.unmount();
}

#[tokio::test]
async fn restored_tab_with_old_heartbeat_is_purged() {
    let browser = FakeBrowser::signed_in();
    browser.with_navigation(NavigationType::BackForward);
    browser.with_storage(ACTIVE_FLAG_KEY, "checked");
    browser.with_storage(LAST_BEAT_KEY, &encode_signal(T0 - 60_000));
    let mut monitor = PresenceMonitor::new(browser.context(clock()), GuardPolicy::default());

    assert_eq!(monitor.mount().await, BootOutcome::Purged);
    assert_eq!(browser.sign_out_calls(), 1);
}

#[tokio::test]
async fn fresh_signal_cookie_from_login_outweighs_old_stored_beat() {
    let browser = FakeBrowser::signed_in();
    browser.with_navigation(NavigationType::Navigate);
    browser.with_storage(ACTIVE_FLAG_KEY, "checked");
    browser.with_storage(LAST_BEAT_KEY, &encode_signal(T0 - 120_000));
    browser.with_cookie("session_presence", &encode_signal(T0 - 1_000));
    let mut monitor = PresenceMonitor::new(browser.context(clock()), GuardPolicy::default());

    assert_eq!(monitor.mount().await, BootOutcome::Passed);
    assert_eq!(browser.sign_out_calls(), 0);
    monitor.unmount();
}

#[tokio::test]
async fn anonymous_fresh_tab_passes_and_is_marked() {
    let browser = Arc::new(FakeBrowser::default());
    let mut monitor = PresenceMonitor::new(browser.context(clock()), GuardPolicy::default());

    assert_eq!(monitor.mount().await, BootOutcome::Passed);
    assert_eq!(
        TabStorage::get(&*browser, ACTIVE_FLAG_KEY).as_deref(),
        Some("checked")
    );
    assert_eq!(browser.sign_out_calls(), 0);
    monitor.unmount();
}

#[tokio::test]
async fn unreachable_backend_on_lookup_fails_open() {
    let browser = FakeBrowser::signed_in();
    *browser.user_lookup_fails.lock().unwrap() = true;
    let mut monitor = PresenceMonitor::new(browser.context(clock()), GuardPolicy::default());

    assert_eq!(monitor.mount().await, BootOutcome::Passed);
    assert_eq!(browser.sign_out_calls(), 0);
    monitor.unmount();
}

#[tokio::test(start_paused = true)]
async fn heartbeat_refreshes_storage_and_signal_cookie() {
    let clock = clock();
    let browser = FakeBrowser::signed_in();
    browser.with_storage(ACTIVE_FLAG_KEY, "checked");
    let mut monitor =
        PresenceMonitor::new(browser.context(clock.clone()), GuardPolicy::default());
    assert_eq!(monitor.mount().await, BootOutcome::Passed);
    settle().await;

    assert_eq!(
        TabStorage::get(&*browser, LAST_BEAT_KEY),
        Some(encode_signal(T0))
    );
    let first = browser.signal_writes();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].value, encode_signal(T0));
    assert_eq!(first[0].options.max_age, Some(10));

    clock.advance_ms(2_000);
    tokio::time::sleep(Duration::from_millis(2_000)).await;
    settle().await;

    let writes = browser.signal_writes();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[1].value, encode_signal(T0 + 2_000));
    assert_eq!(
        ScriptCookies::get(&*browser, "session_presence"),
        Some(encode_signal(T0 + 2_000))
    );
    monitor.unmount();
}

#[tokio::test(start_paused = true)]
async fn returning_to_a_hidden_tab_beats_immediately() {
    let clock = clock();
    let browser = FakeBrowser::signed_in();
    browser.with_storage(ACTIVE_FLAG_KEY, "checked");
    let mut monitor =
        PresenceMonitor::new(browser.context(clock.clone()), GuardPolicy::default());
    monitor.mount().await;
    settle().await;

    clock.advance_ms(1_200);
    browser.emit(ActivityKind::VisibilityChange);
    settle().await;

    let writes = browser.signal_writes();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[1].value, encode_signal(T0 + 1_200));
    monitor.unmount();
}

#[tokio::test(start_paused = true)]
async fn eleven_idle_minutes_sign_out_exactly_once() {
    let browser = FakeBrowser::signed_in();
    browser.with_storage(ACTIVE_FLAG_KEY, "checked");
    let mut monitor = PresenceMonitor::new(browser.context(clock()), GuardPolicy::default());
    monitor.mount().await;

    tokio::time::sleep(Duration::from_secs(11 * 60)).await;
    settle().await;

    assert_eq!(browser.sign_out_calls(), 1);
    assert_eq!(*browser.pushes.lock().unwrap(), vec!["/login"]);
    assert_eq!(*browser.notices.lock().unwrap(), vec![Notice::Inactivity]);

    tokio::time::sleep(Duration::from_secs(30 * 60)).await;
    settle().await;
    assert_eq!(browser.sign_out_calls(), 1);
    monitor.unmount();
}

#[tokio::test(start_paused = true)]
async fn activity_spaced_under_the_window_keeps_the_session() {
    let browser = FakeBrowser::signed_in();
    browser.with_storage(ACTIVE_FLAG_KEY, "checked");
    let mut monitor = PresenceMonitor::new(browser.context(clock()), GuardPolicy::default());
    monitor.mount().await;

    for kind in [
        ActivityKind::MouseMove,
        ActivityKind::KeyDown,
        ActivityKind::Scroll,
        ActivityKind::TouchStart,
        ActivityKind::MouseDown,
    ] {
        tokio::time::sleep(Duration::from_secs(9 * 60 + 59)).await;
        browser.emit(kind);
        settle().await;
    }

    assert_eq!(browser.sign_out_calls(), 0);
    assert!(browser.pushes.lock().unwrap().is_empty());
    monitor.unmount();
}

#[tokio::test(start_paused = true)]
async fn idle_expiry_without_a_user_does_nothing() {
    let browser = Arc::new(FakeBrowser::default());
    let mut monitor = PresenceMonitor::new(browser.context(clock()), GuardPolicy::default());
    monitor.mount().await;

    tokio::time::sleep(Duration::from_secs(11 * 60)).await;
    settle().await;

    assert_eq!(browser.sign_out_calls(), 0);
    assert!(browser.notices.lock().unwrap().is_empty());
    monitor.unmount();
}

#[tokio::test(start_paused = true)]
async fn unmount_stops_timers_and_detaches_listeners() {
    let browser = FakeBrowser::signed_in();
    browser.with_storage(ACTIVE_FLAG_KEY, "checked");
    let mut monitor = PresenceMonitor::new(browser.context(clock()), GuardPolicy::default());
    monitor.mount().await;
    settle().await;
    assert_eq!(browser.listener_count(), 6);
    assert_eq!(monitor.listener_count(), 6);

    monitor.unmount();
    monitor.unmount();
    let writes_at_unmount = browser.signal_writes().len();

    tokio::time::sleep(Duration::from_secs(20 * 60)).await;
    settle().await;

    assert_eq!(browser.listener_count(), 0);
    assert_eq!(browser.signal_writes().len(), writes_at_unmount);
    assert_eq!(browser.sign_out_calls(), 0);
}

#[tokio::test]
async fn dropping_the_monitor_detaches_listeners() {
    let browser = FakeBrowser::signed_in();
    browser.with_storage(ACTIVE_FLAG_KEY, "checked");
    {
        let mut monitor =
            PresenceMonitor::new(browser.context(clock()), GuardPolicy::default());
        monitor.mount().await;
        assert_eq!(browser.listener_count(), 6);
    }
    assert_eq!(browser.listener_count(), 0);
}

#[tokio::test]
async fn manual_sign_out_wipes_local_state_first() {
    let browser = FakeBrowser::signed_in();
    browser.with_storage(ACTIVE_FLAG_KEY, "checked");
    let mut monitor = PresenceMonitor::new(browser.context(clock()), GuardPolicy::default());
    monitor.mount().await;

    monitor.sign_out_now().await;

    assert_eq!(browser.sign_out_calls(), 1);
    assert_eq!(TabStorage::get(&*browser, ACTIVE_FLAG_KEY), None);
    assert_eq!(ScriptCookies::get(&*browser, "session_presence"), None);
    assert_eq!(*browser.hard_redirects.lock().unwrap(), vec!["/login"]);
    assert_eq!(monitor.current_gate(), RenderGate::Purged);
    assert_eq!(browser.listener_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn hard_navigation_between_beats_keeps_the_session() {
    let clock = clock();
    let browser = FakeBrowser::signed_in();
    browser.with_storage(ACTIVE_FLAG_KEY, "checked");
    let policy = GuardPolicy::default();
    let mut page = PresenceMonitor::new(browser.context(clock.clone()), policy.clone());
    assert_eq!(page.mount().await, BootOutcome::Passed);
    settle().await;
    page.unmount();

    // The next page mounts just before the beat that would have followed.
    clock.advance_ms(policy.heartbeat_interval_ms as i64 - 1);
    browser.with_navigation(NavigationType::Navigate);
    let mut next_page = PresenceMonitor::new(browser.context(clock.clone()), policy);

    assert_eq!(next_page.mount().await, BootOutcome::Passed);
    assert_eq!(next_page.current_gate(), RenderGate::Ready);
    assert_eq!(browser.sign_out_calls(), 0);
    assert!(browser.hard_redirects.lock().unwrap().is_empty());
    next_page.unmount();
}
