//! Chart worker.
//!
//! Renders a rolling two-minute price chart for one instrument to the
//! terminal, one frame per second. The per-second price series comes
//! from the sorted set maintained by the key-value sink; gaps are
//! forward-filled with the most recent observation. The terminal is
//! handed back to the caller on exit.

use std::collections::HashMap;
use std::io::Stdout;

use chrono::Utc;
use crossterm::event::{self, Event, KeyCode, KeyModifiers};
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use log::warn;
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Layout};
use ratatui::symbols;
use ratatui::widgets::{Axis, Chart, Dataset, GraphType, Paragraph};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::time::Duration;

use crate::error::Result;
use crate::sinks::redis_kv;

/// Seconds of history shown per frame.
pub const WINDOW_SECONDS: i64 = 120;

/// Decode `<epoch>/<price>` members of the price series.
pub fn parse_price_points(values: &[String]) -> Vec<(i64, f64)> {
    values
        .iter()
        .filter_map(|value| {
            let (epoch, price) = value.split_once('/')?;
            Some((epoch.parse::<f64>().ok()? as i64, price.parse().ok()?))
        })
        .collect()
}

/// Densify a sparse per-second series over `from..=to` by carrying the
/// most recent observation across gaps. Seconds before the first
/// observation produce nothing, so the series can be shorter than the
/// window.
pub fn forward_fill(points: &[(i64, f64)], from: i64, to: i64) -> Vec<f64> {
    let by_epoch: HashMap<i64, f64> = points.iter().copied().collect();
    let mut series = Vec::with_capacity((to - from + 1).max(0) as usize);
    let mut last = None;
    for epoch in from..=to {
        match by_epoch.get(&epoch) {
            Some(price) => {
                series.push(*price);
                last = Some(*price);
            }
            None => {
                if let Some(price) = last {
                    series.push(price);
                }
            }
        }
    }
    series
}

pub struct ChartWorker {
    conn: ConnectionManager,
    exchange: String,
    instmt: String,
}

impl ChartWorker {
    pub fn new(conn: ConnectionManager, exchange: &str, instmt: &str) -> Self {
        Self {
            conn,
            exchange: exchange.to_lowercase(),
            instmt: instmt.to_lowercase(),
        }
    }

    /// Own the terminal until the user quits (`q` or Ctrl-C), then
    /// restore it.
    pub async fn run(mut self) -> Result<()> {
        enable_raw_mode()?;
        let mut stdout = std::io::stdout();
        crossterm::execute!(stdout, EnterAlternateScreen)?;
        let mut terminal =
            Terminal::new(CrosstermBackend::new(stdout)).map_err(crate::error::FeedError::from)?;

        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            if let Err(err) = self.render_frame(&mut terminal).await {
                warn!("chart frame failed: {err}");
            }
            if quit_requested()? {
                break;
            }
        }

        disable_raw_mode()?;
        crossterm::execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
        terminal.show_cursor().map_err(crate::error::FeedError::from)?;
        Ok(())
    }

    async fn render_frame(
        &mut self,
        terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    ) -> Result<()> {
        let to = Utc::now().timestamp();
        let from = to - WINDOW_SECONDS;
        let prices_key = redis_kv::prices_key(&self.exchange, &self.instmt);
        let raw: Vec<String> = self
            .conn
            .zrangebyscore(&prices_key, format!("({from}"), format!("({to}"))
            .await?;
        if raw.is_empty() {
            return Ok(());
        }

        let series = forward_fill(&parse_price_points(&raw), from, to);
        let Some(last_price) = series.last().copied() else {
            return Ok(());
        };
        let points: Vec<(f64, f64)> = series
            .iter()
            .enumerate()
            .map(|(i, price)| (i as f64, *price))
            .collect();
        let (low, high) = series
            .iter()
            .fold((f64::MAX, f64::MIN), |(lo, hi), p| (lo.min(*p), hi.max(*p)));

        let title = format!("{}/{} {last_price}", self.exchange, self.instmt);
        terminal
            .draw(|frame| {
                let [header, body] =
                    Layout::vertical([Constraint::Length(1), Constraint::Min(0)])
                        .areas(frame.area());
                frame.render_widget(Paragraph::new(title.clone()), header);

                let datasets = vec![
                    Dataset::default()
                        .marker(symbols::Marker::Braille)
                        .graph_type(GraphType::Line)
                        .data(&points),
                ];
                let chart = Chart::new(datasets)
                    .x_axis(Axis::default().bounds([0.0, WINDOW_SECONDS as f64]))
                    .y_axis(Axis::default().bounds([low, high]));
                frame.render_widget(chart, body);
            })
            .map_err(crate::error::FeedError::from)?;
        Ok(())
    }
}

/// Drain pending input; `q` or Ctrl-C ends the worker.
fn quit_requested() -> Result<bool> {
    while event::poll(std::time::Duration::from_millis(0))? {
        if let Event::Key(key) = event::read()? {
            let ctrl_c =
                key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL);
            if key.code == KeyCode::Char('q') || ctrl_c {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_points_decode() {
        let raw = vec!["1700000000/100.5".to_string(), "bad".to_string()];
        assert_eq!(parse_price_points(&raw), vec![(1_700_000_000, 100.5)]);
    }

    #[test]
    fn forward_fill_carries_the_last_observation() {
        let points = vec![(10, 100.0), (13, 101.0)];
        assert_eq!(
            forward_fill(&points, 10, 15),
            vec![100.0, 100.0, 100.0, 101.0, 101.0, 101.0]
        );
    }

    #[test]
    fn seconds_before_the_first_observation_are_skipped() {
        let points = vec![(12, 100.0)];
        assert_eq!(forward_fill(&points, 10, 13), vec![100.0, 100.0]);
    }

    #[test]
    fn empty_input_fills_nothing() {
        assert!(forward_fill(&[], 10, 15).is_empty());
    }
}
