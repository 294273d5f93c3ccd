//! Plain-text table output.

use crate::container::Container;
use crate::errors::Result;
use crate::poll::PollCycleResult;
use chrono::{DateTime, Local};
use std::io::Write;

const HEADERS: [&str; 6] = ["Host", "Names", "State", "Status", "Ports", "Image"];

/// Receives the assembled result of every cycle.
pub trait Presenter: Send {
    fn present(&mut self, results: &[PollCycleResult]) -> Result<()>;
}

/// Writes one table per cycle to `W`.
pub struct TablePresenter<W> {
    out: W,
    with_tunnels: bool,
    include_all: bool,
}

impl<W: Write + Send> TablePresenter<W> {
    pub fn new(out: W, with_tunnels: bool, include_all: bool) -> Self {
        Self {
            out,
            with_tunnels,
            include_all,
        }
    }
}

impl<W: Write + Send> Presenter for TablePresenter<W> {
    fn present(&mut self, results: &[PollCycleResult]) -> Result<()> {
        let table = render_table(results, self.with_tunnels, self.include_all, Local::now());
        self.out.write_all(table.as_bytes())?;
        self.out.flush()?;
        Ok(())
    }
}

fn row(host: &str, c: &Container, with_tunnels: bool) -> Vec<String> {
    let mut cells = vec![
        host.to_owned(),
        c.name.clone(),
        c.state.clone(),
        c.status.clone(),
        c.ports_display(),
        c.image.clone(),
    ];
    if with_tunnels {
        cells.push(c.tunnel.as_ref().map(ToString::to_string).unwrap_or_default());
    }
    cells
}

fn rule(widths: &[usize]) -> String {
    let mut line = String::from("+");
    for w in widths {
        line.push_str(&"-".repeat(w + 2));
        line.push('+');
    }
    line.push('\n');
    line
}

fn cells_line(cells: &[String], widths: &[usize]) -> String {
    let mut line = String::from("|");
    for (cell, w) in cells.iter().zip(widths) {
        line.push_str(&format!(" {cell:<w$} |"));
    }
    line.push('\n');
    line
}

/// Render one cycle. Each host's name is printed on its first row only.
///
/// With `include_all`, running containers come first within a host.
pub fn render_table(
    results: &[PollCycleResult],
    with_tunnels: bool,
    include_all: bool,
    at: DateTime<Local>,
) -> String {
    let mut headers: Vec<String> = HEADERS.iter().map(|h| h.to_string()).collect();
    if with_tunnels {
        headers.push("Tunnel".to_owned());
    }

    let mut rows = Vec::new();
    for result in results {
        let mut containers: Vec<&Container> = result.containers.iter().collect();
        if include_all {
            // stable, so listing order survives within each group
            containers.sort_by_key(|c| !c.is_running());
        }
        for (i, c) in containers.into_iter().enumerate() {
            let host = if i == 0 { result.target.host.as_str() } else { "" };
            rows.push(row(host, c, with_tunnels));
        }
    }

    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for cells in &rows {
        for (w, cell) in widths.iter_mut().zip(cells) {
            *w = (*w).max(cell.chars().count());
        }
    }

    let mut out = format!("Containers at {}\n", at.format("%Y-%m-%d %H:%M:%S"));
    out.push_str(&rule(&widths));
    out.push_str(&cells_line(&headers, &widths));
    out.push_str(&rule(&widths));
    for cells in &rows {
        out.push_str(&cells_line(cells, &widths));
    }
    out.push_str(&rule(&widths));
    out
}
