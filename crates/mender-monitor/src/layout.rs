use mender_core::config::MonitorConfig;
use mender_core::types::FailureId;

use crate::failure::Failure;
use crate::store::MonitorStore;

/// Callback for an operator intent on a failure.
pub type IntentHandler = Box<dyn Fn(&FailureId) + Send + Sync>;

/// What the center of the monitoring layout shows.
#[derive(Debug, Clone, PartialEq)]
pub enum CenterView<'a> {
    /// Nothing selected (or the selection no longer resolves).
    FullList { failures: Vec<&'a Failure> },
    /// A narrow list next to the selected failure's detail panel.
    Detail {
        collapsed: Vec<&'a Failure>,
        failure: &'a Failure,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayoutView<'a> {
    pub center: CenterView<'a>,
    pub submit_form_open: bool,
}

/// Routes between the full failure list and the selected-failure detail,
/// and forwards retry/escalate intents to its owner.
///
/// The layout writes nothing but the store's selection. Retry and escalate
/// never touch failure state here.
pub struct MonitoringLayout {
    submit_form_open: bool,
    on_retry: Option<IntentHandler>,
    on_escalate: Option<IntentHandler>,
    list_limit: usize,
    collapsed_rows: usize,
}

impl Default for MonitoringLayout {
    fn default() -> Self {
        Self::new(&MonitorConfig::default())
    }
}

impl MonitoringLayout {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            submit_form_open: false,
            on_retry: None,
            on_escalate: None,
            list_limit: config.list_limit,
            collapsed_rows: config.collapsed_rows.max(1),
        }
    }

    pub fn with_retry_handler(mut self, handler: impl Fn(&FailureId) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Box::new(handler));
        self
    }

    pub fn with_escalate_handler(
        mut self,
        handler: impl Fn(&FailureId) + Send + Sync + 'static,
    ) -> Self {
        self.on_escalate = Some(Box::new(handler));
        self
    }

    pub fn view<'a>(&self, store: &'a MonitorStore) -> LayoutView<'a> {
        let failures = store.list(None, self.list_limit);
        let center = match store.selected_failure() {
            Some(failure) => CenterView::Detail {
                collapsed: self.collapsed_window(&failures, failure),
                failure,
            },
            None => CenterView::FullList { failures },
        };
        LayoutView {
            center,
            submit_form_open: self.submit_form_open,
        }
    }

    pub fn select(&self, store: &mut MonitorStore, id: FailureId) {
        store.set_selected_failure_id(Some(id));
    }

    pub fn close_detail(&self, store: &mut MonitorStore) {
        store.set_selected_failure_id(None);
    }

    /// Flip the submit form. Returns the new state.
    pub fn toggle_submit_form(&mut self) -> bool {
        self.submit_form_open = !self.submit_form_open;
        self.submit_form_open
    }

    pub fn is_submit_form_open(&self) -> bool {
        self.submit_form_open
    }

    /// Forward a retry intent. Returns whether a handler ran.
    pub fn retry(&self, id: &FailureId) -> bool {
        forward(self.on_retry.as_ref(), id)
    }

    /// Forward an escalate intent. Returns whether a handler ran.
    pub fn escalate(&self, id: &FailureId) -> bool {
        forward(self.on_escalate.as_ref(), id)
    }

    /// Up to `collapsed_rows` entries of `list`, keeping `selected` in view.
    ///
    /// A selection outside `list` leads the window.
    fn collapsed_window<'a>(&self, list: &[&'a Failure], selected: &'a Failure) -> Vec<&'a Failure> {
        let Some(position) = list.iter().position(|f| f.id == selected.id) else {
            let mut window = vec![selected];
            window.extend(list.iter().take(self.collapsed_rows - 1).copied());
            return window;
        };
        let rows = self.collapsed_rows.min(list.len());
        let start = position
            .saturating_sub(rows / 2)
            .min(list.len().saturating_sub(rows));
        list[start..start + rows].to_vec()
    }
}

fn forward(handler: Option<&IntentHandler>, id: &FailureId) -> bool {
    match handler {
        Some(handler) => {
            handler(id);
            true
        }
        None => false,
    }
}
