use itertools::Itertools;
use rand::Rng;
use rand::seq::SliceRandom;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

/// Largest component the enumerator explores in a fixed order. Bigger
/// components randomize the try-order at every node and their result is a
/// representative sample rather than a census.
const MAX_COMPONENT_SIZE: usize = 100;

/// Search-tree visitation budget shared by all components of one query.
const NODE_BUDGET: u64 = 2_000_000;

/// Represents a 2D coordinate on the minesweeper board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Point {
    pub x: usize,
    pub y: usize,
}

/// The visible state of a single cell on the board.
/// This is the only information the probability engine is allowed to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Cell {
    Hidden,
    Flagged,
    Revealed(u8), // The u8 is the number of adjacent mines.
}

/// Represents the current state of the game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum GameState {
    Playing,
    Won,
    Lost,
}

/// A read-only snapshot of the visible board, as supplied by the board
/// provider. The engine never mutates one; every query recomputes from
/// scratch, so two queries on different snapshots share no state.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Board {
    pub width: usize,
    pub height: usize,
    /// The visible state of the board. This is the "ground truth" for the engine.
    pub cells: Vec<Vec<Cell>>,
    /// The total number of mines the board contains. This acts as a global constraint.
    pub total_mines: usize,
}

/// Represents a single linear constraint over hidden cells.
/// For example, a revealed '2' with one flagged neighbor requires exactly 1
/// mine among its remaining hidden neighbors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Constraint {
    /// The set of hidden cells this constraint applies to.
    pub variables: BTreeSet<Point>,
    /// The exact number of mines that must be present among the constraint's
    /// variables. Negative on an over-flagged board; such a constraint is
    /// unsatisfiable and gets dropped during propagation.
    pub required_mines: i32,
}

/// The result of one probability query over a snapshot.
#[derive(Debug, Clone)]
pub struct Analysis {
    /// Mine probability for every hidden cell on the board, in `[0.0, 1.0]`.
    pub probabilities: HashMap<Point, f64>,
    /// Cells propagation proved clear. Always reported as exactly 0.0.
    pub deduced_safe: HashSet<Point>,
    /// Cells propagation proved mined. Always reported as exactly 1.0.
    pub deduced_mines: HashSet<Point>,
    /// False when any component was sampled instead of fully enumerated, hit
    /// a contradiction, or the uniform fallback fired. The probabilities are
    /// then estimates instead of exact marginals.
    pub exhaustive: bool,
}

// --- Board Snapshot Implementation ---

impl Board {
    /// Creates an all-hidden snapshot of the given dimensions.
    pub fn new(width: usize, height: usize, total_mines: usize) -> Self {
        if total_mines >= width * height {
            panic!("Total mines must be less than the number of cells on the board.");
        }
        Board {
            width,
            height,
            cells: vec![vec![Cell::Hidden; width]; height],
            total_mines,
        }
    }

    /// Deserializes a snapshot from bytes.
    pub fn deserialize(bts: &Vec<u8>) -> Self {
        bcs::from_bytes(bts).unwrap()
    }

    /// Serializes the snapshot to bytes.
    pub fn serialize(&self) -> Vec<u8> {
        bcs::to_bytes(self).unwrap()
    }

    /// Checks the snapshot against the provider contract. A malformed
    /// snapshot (zero dimensions, mismatched rows, more mines than cells)
    /// rejects the query instead of producing garbage probabilities.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.width == 0 || self.height == 0 {
            anyhow::bail!("empty_board");
        }
        if self.cells.len() != self.height || self.cells.iter().any(|row| row.len() != self.width) {
            anyhow::bail!("board_shape_mismatch");
        }
        if self.total_mines >= self.width * self.height {
            anyhow::bail!("too_many_mines");
        }
        Ok(())
    }

    pub fn cell(&self, at: Point) -> Cell {
        self.cells[at.y][at.x]
    }

    /// Number of cells currently flagged.
    pub fn flagged_count(&self) -> usize {
        self.cells
            .iter()
            .flatten()
            .filter(|cell| matches!(cell, Cell::Flagged))
            .count()
    }

    /// Every cell still hidden, in row-major order. Flagged cells are not
    /// hidden: they are standing claims about a mine.
    pub fn hidden_cells(&self) -> Vec<Point> {
        let mut hidden = Vec::new();
        for y in 0..self.height {
            for x in 0..self.width {
                if matches!(self.cells[y][x], Cell::Hidden) {
                    hidden.push(Point { x, y });
                }
            }
        }
        hidden
    }

    /// A helper function to get all valid neighbor coordinates for a given
    /// point. It correctly handles board edges and corners.
    fn neighbors(&self, point: Point) -> impl Iterator<Item = Point> {
        let width = self.width;
        let height = self.height;

        (-1..=1).flat_map(move |dy: isize| {
            (-1..=1).filter_map(move |dx: isize| {
                if dx == 0 && dy == 0 {
                    return None;
                }

                let nx = point.x as isize + dx;
                let ny = point.y as isize + dy;

                if nx >= 0 && nx < width as isize && ny >= 0 && ny < height as isize {
                    Some(Point {
                        x: nx as usize,
                        y: ny as usize,
                    })
                } else {
                    None
                }
            })
        })
    }

    /// Translates the visible board into a set of constraints: one record
    /// per revealed clue that still has hidden neighbors. Flagged neighbors
    /// are treated as claimed mines and subtracted from the clue, which can
    /// drive the remainder negative on an over-flagged board; the record is
    /// still emitted and it is up to propagation to discard it.
    pub fn build_constraints(&self) -> Vec<Constraint> {
        let mut constraints = BTreeSet::new();

        for y in 0..self.height {
            for x in 0..self.width {
                let clue = match self.cells[y][x] {
                    Cell::Revealed(n) if n > 0 => n,
                    _ => continue,
                };

                let mut flagged = 0i32;
                let mut variables = BTreeSet::new();
                for neighbor in self.neighbors(Point { x, y }) {
                    match self.cell(neighbor) {
                        Cell::Hidden => {
                            variables.insert(neighbor);
                        }
                        Cell::Flagged => flagged += 1,
                        Cell::Revealed(_) => {}
                    }
                }

                // A clue whose neighborhood is fully resolved carries no
                // information.
                if variables.is_empty() {
                    continue;
                }

                constraints.insert(Constraint {
                    variables,
                    required_mines: clue as i32 - flagged,
                });
            }
        }

        // The ordered set already collapsed duplicate records.
        constraints.into_iter().collect()
    }
}

// --- Deterministic Propagation ---

/// Everything deterministic deduction managed to prove, plus the constraints
/// it could not discharge.
#[derive(Debug, Default)]
struct Propagation {
    safe: HashSet<Point>,
    mines: HashSet<Point>,
    residual: Vec<Constraint>,
}

/// A cell may only ever be claimed once; on an inconsistent snapshot the
/// first claim wins and the opposite one is ignored.
fn mark_safe(cell: Point, safe: &mut HashSet<Point>, mines: &HashSet<Point>) -> bool {
    !mines.contains(&cell) && safe.insert(cell)
}

fn mark_mine(cell: Point, mines: &mut HashSet<Point>, safe: &HashSet<Point>) -> bool {
    !safe.contains(&cell) && mines.insert(cell)
}

/// Runs direct resolution and integer elimination to a fixed point.
///
/// Direct resolution strips already-deduced cells out of each constraint and
/// reads off the two trivial cases: a remainder of zero clears every
/// remaining variable, a remainder equal to the variable count mines them
/// all. Contradictory remainders (possible when the provider over-flags)
/// drop the constraint rather than failing the query.
///
/// The deduced sets only ever grow; the loop ends on the first round that
/// proves nothing new.
fn propagate(mut constraints: Vec<Constraint>) -> Propagation {
    let mut safe: HashSet<Point> = HashSet::new();
    let mut mines: HashSet<Point> = HashSet::new();

    loop {
        let mut changed = false;

        let mut residual = Vec::with_capacity(constraints.len());
        for constraint in constraints {
            let variables: BTreeSet<Point> = constraint
                .variables
                .iter()
                .filter(|cell| !safe.contains(cell) && !mines.contains(cell))
                .copied()
                .collect();
            let known_mines = constraint
                .variables
                .iter()
                .filter(|cell| mines.contains(cell))
                .count() as i32;
            let required = constraint.required_mines - known_mines;

            if required < 0 || required > variables.len() as i32 || variables.is_empty() {
                continue;
            }
            if required == 0 {
                for cell in variables {
                    changed |= mark_safe(cell, &mut safe, &mines);
                }
            } else if required == variables.len() as i32 {
                for cell in variables {
                    changed |= mark_mine(cell, &mut mines, &safe);
                }
            } else {
                residual.push(Constraint {
                    variables,
                    required_mines: required,
                });
            }
        }
        constraints = residual;

        if !constraints.is_empty() {
            changed |= eliminate(&constraints, &mut safe, &mut mines);
        }

        if !changed {
            return Propagation {
                safe,
                mines,
                residual: constraints,
            };
        }
    }
}

/// One pass of exact integer Gaussian elimination over the residual
/// constraints. Returns true if it proved any new cell.
///
/// Rows combine by multiply-then-subtract so every entry stays an exact
/// integer, and each combined row is divided through by the GCD of its
/// entries to keep coefficients from growing. A reduced row resolves cells
/// when its remainder reaches an extreme of the achievable sum: equal to the
/// positive-coefficient sum (every positive-side cell is a mine, every
/// negative-side cell is clear) or to the negated negative-coefficient sum
/// (the reverse). Single-variable rows and subset/superset relations between
/// overlapping clues both resolve through this bound.
fn eliminate(
    constraints: &[Constraint],
    safe: &mut HashSet<Point>,
    mines: &mut HashSet<Point>,
) -> bool {
    let cells: Vec<Point> = constraints
        .iter()
        .flat_map(|constraint| constraint.variables.iter().copied())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let index: HashMap<Point, usize> = cells.iter().enumerate().map(|(i, &c)| (c, i)).collect();
    let width = cells.len() + 1; // augmented with the remainder column

    let mut matrix: Vec<Vec<i64>> = constraints
        .iter()
        .map(|constraint| {
            let mut row = vec![0i64; width];
            for cell in &constraint.variables {
                row[index[cell]] = 1;
            }
            row[width - 1] = constraint.required_mines as i64;
            row
        })
        .collect();

    // Forward elimination, reducing every other row at each pivot.
    let mut pivot_row = 0;
    for col in 0..cells.len() {
        if pivot_row >= matrix.len() {
            break;
        }
        let Some(found) = (pivot_row..matrix.len()).find(|&r| matrix[r][col] != 0) else {
            continue;
        };
        matrix.swap(pivot_row, found);

        let pivot_vals = matrix[pivot_row].clone();
        let pivot = pivot_vals[col];
        for r in 0..matrix.len() {
            if r == pivot_row || matrix[r][col] == 0 {
                continue;
            }
            let factor = matrix[r][col];
            let row = &mut matrix[r];
            for j in 0..width {
                row[j] = row[j] * pivot - factor * pivot_vals[j];
            }
            normalize_row(row);
        }
        pivot_row += 1;
    }

    let mut changed = false;
    for row in &matrix {
        let mut positive = Vec::new();
        let mut negative = Vec::new();
        let mut max = 0i64;
        let mut min = 0i64;
        for (i, &coefficient) in row[..width - 1].iter().enumerate() {
            if coefficient > 0 {
                positive.push(cells[i]);
                max += coefficient;
            } else if coefficient < 0 {
                negative.push(cells[i]);
                min += coefficient;
            }
        }
        if positive.is_empty() && negative.is_empty() {
            continue;
        }

        let remainder = row[width - 1];
        if remainder == max {
            for &cell in &positive {
                changed |= mark_mine(cell, mines, safe);
            }
            for &cell in &negative {
                changed |= mark_safe(cell, safe, mines);
            }
        } else if remainder == min {
            for &cell in &positive {
                changed |= mark_safe(cell, safe, mines);
            }
            for &cell in &negative {
                changed |= mark_mine(cell, mines, safe);
            }
        }
    }
    changed
}

/// Divides a row through by the GCD of its entries.
fn normalize_row(row: &mut [i64]) {
    let mut divisor = 0i64;
    for &entry in row.iter() {
        divisor = gcd(divisor, entry.abs());
    }
    if divisor > 1 {
        for entry in row.iter_mut() {
            *entry /= divisor;
        }
    }
}

fn gcd(mut a: i64, mut b: i64) -> i64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

// --- Component Partitioning ---

/// A maximal group of frontier cells connected through shared constraints,
/// together with the constraints restricted to it. Components are mutually
/// independent and are enumerated separately.
#[derive(Debug, Clone)]
struct Component {
    cells: Vec<Point>,
    constraints: Vec<Constraint>,
}

fn find_root(parent: &mut HashMap<Point, Point>, mut cell: Point) -> Point {
    while parent[&cell] != cell {
        let grandparent = parent[&parent[&cell]];
        parent.insert(cell, grandparent);
        cell = grandparent;
    }
    cell
}

/// Splits the residual constraints into independent components with a
/// union-find over their variables: two cells join when they co-occur in a
/// constraint, and constraints sharing a cell merge transitively. Components
/// come out in coordinate order so repeated queries see identical groupings.
fn partition_components(residual: &[Constraint]) -> Vec<Component> {
    let mut parent: HashMap<Point, Point> = HashMap::new();
    for constraint in residual {
        for &cell in &constraint.variables {
            parent.entry(cell).or_insert(cell);
        }
    }

    for constraint in residual {
        let mut vars = constraint.variables.iter().copied();
        let Some(first) = vars.next() else { continue };
        for cell in vars {
            let a = find_root(&mut parent, first);
            let b = find_root(&mut parent, cell);
            if a != b {
                parent.insert(a, b);
            }
        }
    }

    let frontier: BTreeSet<Point> = parent.keys().copied().collect();
    let mut groups: BTreeMap<Point, Component> = BTreeMap::new();
    for &cell in &frontier {
        let root = find_root(&mut parent, cell);
        groups
            .entry(root)
            .or_insert_with(|| Component {
                cells: Vec::new(),
                constraints: Vec::new(),
            })
            .cells
            .push(cell);
    }
    for constraint in residual {
        if let Some(&first) = constraint.variables.iter().next() {
            let root = find_root(&mut parent, first);
            if let Some(component) = groups.get_mut(&root) {
                component.constraints.push(constraint.clone());
            }
        }
    }

    groups.into_values().collect()
}

// --- Bounded Enumeration ---

/// One satisfying assignment for a component: which of its cells (in the
/// component's cell order) carry a mine, and how many in total.
#[derive(Debug, Clone)]
struct Assignment {
    mines_at: Vec<bool>,
    mine_count: usize,
}

/// The complete assignments found for one component.
#[derive(Debug)]
struct Enumeration {
    cells: Vec<Point>,
    assignments: Vec<Assignment>,
    /// True when the assignments are a sample rather than a census: the node
    /// budget ran out, or the component was large enough to randomize.
    truncated: bool,
}

struct Search<'a> {
    constraints: &'a [Constraint],
    index: &'a HashMap<Point, usize>,
    touching: &'a [Vec<usize>],
    assignment: Vec<bool>,
    results: Vec<Assignment>,
    budget: &'a mut u64,
    truncated: bool,
    randomize: bool,
}

impl Search<'_> {
    /// Quick feasibility bound for assigning `value` at `pos`: a constraint
    /// fails once its committed mines exceed its target, or once too few
    /// undecided cells remain to ever reach it.
    fn feasible(&self, pos: usize, value: bool) -> bool {
        for &ci in &self.touching[pos] {
            let constraint = &self.constraints[ci];
            let mut committed = 0i32;
            let mut undecided = 0i32;
            for cell in &constraint.variables {
                let j = self.index[cell];
                if j < pos {
                    committed += self.assignment[j] as i32;
                } else if j == pos {
                    committed += value as i32;
                } else {
                    undecided += 1;
                }
            }
            if committed > constraint.required_mines
                || constraint.required_mines - committed > undecided
            {
                return false;
            }
        }
        true
    }

    fn dfs(&mut self, pos: usize, mines: usize, rng: &mut impl Rng) {
        if self.truncated {
            return;
        }
        if *self.budget == 0 {
            self.truncated = true;
            return;
        }
        *self.budget -= 1;

        if pos == self.assignment.len() {
            self.results.push(Assignment {
                mines_at: self.assignment.clone(),
                mine_count: mines,
            });
            return;
        }

        // Under an exhausted budget a fixed try-order would bias the sample
        // toward all-safe or all-mine prefixes.
        let order = if self.randomize && rng.random_bool(0.5) {
            [true, false]
        } else {
            [false, true]
        };
        for value in order {
            if self.feasible(pos, value) {
                self.assignment[pos] = value;
                self.dfs(pos + 1, mines + value as usize, rng);
                self.assignment[pos] = false;
            }
        }
    }
}

/// Depth-first enumeration of every assignment satisfying a component's
/// constraints, bounded by the shared node budget. Cells that appear in many
/// constraints are decided first so infeasible branches die early. An empty
/// assignment list means the component is contradictory (or the budget died
/// before the first leaf); the caller folds its cells back into the
/// unconstrained pool.
fn enumerate_component(component: &Component, budget: &mut u64, rng: &mut impl Rng) -> Enumeration {
    let mut degree: HashMap<Point, usize> = HashMap::new();
    for constraint in &component.constraints {
        for &cell in &constraint.variables {
            *degree.entry(cell).or_insert(0) += 1;
        }
    }
    let cells: Vec<Point> = component
        .cells
        .iter()
        .copied()
        .sorted_by_key(|cell| (Reverse(degree.get(cell).copied().unwrap_or(0)), *cell))
        .collect();
    let index: HashMap<Point, usize> = cells.iter().enumerate().map(|(i, &c)| (c, i)).collect();

    let mut touching: Vec<Vec<usize>> = vec![Vec::new(); cells.len()];
    for (ci, constraint) in component.constraints.iter().enumerate() {
        for cell in &constraint.variables {
            touching[index[cell]].push(ci);
        }
    }

    let randomize = cells.len() > MAX_COMPONENT_SIZE;
    let mut search = Search {
        constraints: &component.constraints,
        index: &index,
        touching: &touching,
        assignment: vec![false; cells.len()],
        results: Vec::new(),
        budget,
        truncated: false,
        randomize,
    };
    search.dfs(0, 0, rng);

    Enumeration {
        cells,
        assignments: search.results,
        truncated: search.truncated || randomize,
    }
}

// --- Probability Synthesis ---

/// Mine-count histogram of a component's assignments. Counts are kept as
/// floats so convolving many components cannot overflow; every count this
/// engine produces stays far below 2^53 and remains exact.
type Distribution = BTreeMap<usize, f64>;

fn distribution(enumeration: &Enumeration) -> Distribution {
    let mut dist = Distribution::new();
    for assignment in &enumeration.assignments {
        *dist.entry(assignment.mine_count).or_insert(0.0) += 1.0;
    }
    dist
}

/// Discrete convolution of two mine-count distributions.
fn convolve(lhs: &Distribution, rhs: &Distribution) -> Distribution {
    let mut out = Distribution::new();
    for ((&m1, &c1), (&m2, &c2)) in lhs.iter().cartesian_product(rhs.iter()) {
        *out.entry(m1 + m2).or_insert(0.0) += c1 * c2;
    }
    out
}

/// Binomial coefficient as a float, zero outside `0 <= k <= n`. Exact while
/// the intermediate products stay below 2^53, which covers any playable
/// board size.
fn binomial(n: i64, k: i64) -> f64 {
    if n < 0 || k < 0 || k > n {
        return 0.0;
    }
    let k = k.min(n - k);
    let mut result = 1.0;
    for i in 1..=k {
        result = result * (n - k + i) as f64 / i as f64;
    }
    result
}

/// Combines per-component enumerations into the final probability map.
///
/// Components are independent, so the number of placements with a given
/// total frontier mine count is the convolution of the per-component
/// histograms, and each entry is weighted by how many ways the reservoir
/// (hidden cells outside every constraint) can absorb the leftover mines.
/// A cell's probability is the weight of the assignments that mine it,
/// convolved against every *other* component, over the total weight.
///
/// Returns the map plus whether the exact weighting path was taken; `false`
/// means the snapshot was over-constrained and the uniform estimate was
/// substituted for every unpinned cell.
fn synthesize(
    components: &[Enumeration],
    safe: &HashSet<Point>,
    mines: &HashSet<Point>,
    hidden: &[Point],
    remaining_mines: i64,
) -> (HashMap<Point, f64>, bool) {
    let dists: Vec<Distribution> = components.iter().map(distribution).collect();
    let mut combined = Distribution::from([(0, 1.0)]);
    for dist in &dists {
        combined = convolve(&combined, dist);
    }

    let frontier: usize = components.iter().map(|e| e.cells.len()).sum();
    let reservoir = hidden
        .len()
        .saturating_sub(frontier + safe.len() + mines.len()) as i64;

    let base = remaining_mines - mines.len() as i64;
    let total_weight: f64 = combined
        .iter()
        .map(|(&m, &count)| count * binomial(reservoir, base - m as i64))
        .sum();

    let mut probabilities: HashMap<Point, f64> = HashMap::new();
    for &cell in safe {
        probabilities.insert(cell, 0.0);
    }
    for &cell in mines {
        probabilities.insert(cell, 1.0);
    }

    let reservoir_probability = if total_weight > 0.0 {
        for (i, enumeration) in components.iter().enumerate() {
            let mut others = Distribution::from([(0, 1.0)]);
            for (j, dist) in dists.iter().enumerate() {
                if j != i {
                    others = convolve(&others, dist);
                }
            }

            for (ci, &cell) in enumeration.cells.iter().enumerate() {
                let weight: f64 = enumeration
                    .assignments
                    .iter()
                    .filter(|assignment| assignment.mines_at[ci])
                    .map(|assignment| {
                        others
                            .iter()
                            .map(|(&m, &count)| {
                                count
                                    * binomial(
                                        reservoir,
                                        base - assignment.mine_count as i64 - m as i64,
                                    )
                            })
                            .sum::<f64>()
                    })
                    .sum();
                probabilities.insert(cell, weight / total_weight);
            }
        }

        // Reservoir cells are interchangeable and share one probability:
        // the chance that a specific unconstrained slot holds a mine, given
        // that the slot is consumed from the pool.
        if reservoir > 0 {
            combined
                .iter()
                .map(|(&m, &count)| count * binomial(reservoir - 1, base - m as i64 - 1))
                .sum::<f64>()
                / total_weight
        } else {
            0.0
        }
    } else {
        // Over-constrained or inconsistent snapshot: degrade to the naive
        // uniform estimate instead of failing the query.
        (remaining_mines as f64 / hidden.len().max(1) as f64).clamp(0.0, 1.0)
    };

    let exact = total_weight > 0.0;
    for &cell in hidden {
        probabilities.entry(cell).or_insert(reservoir_probability);
    }
    (probabilities, exact)
}

// --- The Main Probability Query ---

impl Analysis {
    /// Hidden cells that are certainly clear, in coordinate order.
    pub fn safe_cells(&self) -> Vec<Point> {
        self.probabilities
            .iter()
            .filter(|&(_, &p)| p == 0.0)
            .map(|(&cell, _)| cell)
            .sorted()
            .collect()
    }

    /// Hidden cells that certainly hold a mine, in coordinate order.
    pub fn mine_cells(&self) -> Vec<Point> {
        self.probabilities
            .iter()
            .filter(|&(_, &p)| p == 1.0)
            .map(|(&cell, _)| cell)
            .sorted()
            .collect()
    }

    /// The least risky cell to open when nothing is certain. Ties break on
    /// coordinate order so the choice is reproducible.
    pub fn best_guess(&self) -> Option<Point> {
        self.probabilities
            .iter()
            .min_by(|a, b| a.1.total_cmp(b.1).then_with(|| a.0.cmp(b.0)))
            .map(|(&cell, _)| cell)
    }
}

/// Computes the mine probability of every hidden cell on the snapshot.
///
/// The pipeline: extract one constraint per informative clue, propagate
/// deductions to a fixed point (direct resolution plus integer elimination),
/// split the remaining frontier into independent components, enumerate each
/// component's satisfying assignments under the node budget, and weight the
/// component histograms against each other and the global mine count.
///
/// This is a pure query: the snapshot is only read and nothing is cached
/// between calls.
pub fn compute_probabilities(board: &Board) -> anyhow::Result<Analysis> {
    compute_probabilities_with(board, &mut rand::rng())
}

/// Same as [`compute_probabilities`], but with a caller-supplied random
/// source so sampled runs on oversized components are reproducible given a
/// seeded generator. Small positions never consult the generator.
pub fn compute_probabilities_with(board: &Board, rng: &mut impl Rng) -> anyhow::Result<Analysis> {
    board.validate()?;

    let hidden = board.hidden_cells();
    let remaining_mines = board.total_mines as i64 - board.flagged_count() as i64;

    // --- 1. Constraint Extraction ---
    let constraints = board.build_constraints();

    // With no informative clue anywhere, every hidden cell is equally
    // likely to hold one of the remaining mines.
    if constraints.is_empty() {
        let p = (remaining_mines as f64 / hidden.len().max(1) as f64).clamp(0.0, 1.0);
        return Ok(Analysis {
            probabilities: hidden.iter().map(|&cell| (cell, p)).collect(),
            deduced_safe: HashSet::new(),
            deduced_mines: HashSet::new(),
            exhaustive: true,
        });
    }

    // --- 2. Deterministic Propagation ---
    let Propagation {
        safe,
        mines,
        residual,
    } = propagate(constraints);

    // --- 3.-4. Independent Components, Each Enumerated Under One Budget ---
    let mut budget = NODE_BUDGET;
    let mut enumerations = Vec::new();
    let mut degraded = false;
    for component in partition_components(&residual) {
        let enumeration = enumerate_component(&component, &mut budget, rng);
        degraded |= enumeration.truncated;
        if enumeration.assignments.is_empty() {
            // Contradictory or budget-starved component: its cells fall
            // back to unconstrained treatment and rejoin the reservoir.
            degraded = true;
            continue;
        }
        enumerations.push(enumeration);
    }

    // --- 5. Convolution and Binomial Weighting ---
    let (probabilities, exact_weights) =
        synthesize(&enumerations, &safe, &mines, &hidden, remaining_mines);

    Ok(Analysis {
        probabilities,
        deduced_safe: safe,
        deduced_mines: mines,
        exhaustive: !degraded && exact_weights,
    })
}

// --- Reference Board Provider ---

/// A playable game owning the hidden mine layout. The engine never sees the
/// layout; it only reads the visible [`Board`] snapshot.
pub struct Game {
    pub board: Board,
    mines: HashSet<Point>,
    pub state: GameState,
}

impl Game {
    pub fn new(width: usize, height: usize, total_mines: usize) -> Self {
        Game {
            board: Board::new(width, height, total_mines),
            mines: HashSet::new(),
            state: GameState::Playing,
        }
    }

    fn is_first_move(&self) -> bool {
        self.mines.is_empty()
    }

    /// Places mines uniformly over every cell outside the 3x3 block around
    /// the first click, so the opening move never loses.
    fn place_mines(&mut self, first_click: Point) {
        let mut protected: HashSet<Point> = self.board.neighbors(first_click).collect();
        protected.insert(first_click);

        let mut candidates: Vec<Point> = (0..self.board.height)
            .flat_map(|y| (0..self.board.width).map(move |x| Point { x, y }))
            .filter(|point| !protected.contains(point))
            .collect();
        if candidates.len() < self.board.total_mines {
            // Dense board: the full safe block cannot fit, protect only the
            // clicked cell itself.
            candidates = (0..self.board.height)
                .flat_map(|y| (0..self.board.width).map(move |x| Point { x, y }))
                .filter(|&point| point != first_click)
                .collect();
        }

        candidates.shuffle(&mut rand::rng());
        self.mines = candidates
            .into_iter()
            .take(self.board.total_mines)
            .collect();
    }

    /// Counts true mines around a point.
    fn adjacent_mines(&self, point: Point) -> u8 {
        self.board
            .neighbors(point)
            .filter(|neighbor| self.mines.contains(neighbor))
            .count() as u8
    }

    /// Reveals a cell. Returns false when the cell held a mine and the game
    /// is lost. Revealing a zero-clue cell cascades breadth-first through
    /// its neighborhood, as the classic game does.
    pub fn reveal(&mut self, at: Point) -> anyhow::Result<bool> {
        if self.state != GameState::Playing {
            anyhow::bail!("game_ended");
        }
        if !matches!(self.board.cell(at), Cell::Hidden) {
            return Ok(true);
        }

        if self.is_first_move() {
            self.place_mines(at);
        }

        if self.mines.contains(&at) {
            self.state = GameState::Lost;
            return Ok(false);
        }

        self.flood_fill_reveal(at);

        if self.check_win_condition() {
            self.state = GameState::Won;
        }
        Ok(true)
    }

    /// Reveals `start` and cascades through connected zero-clue cells.
    /// Flagged cells are never opened by the cascade.
    fn flood_fill_reveal(&mut self, start: Point) {
        let mut queue = VecDeque::from([start]);
        let mut visited = HashSet::from([start]);

        while let Some(point) = queue.pop_front() {
            if !matches!(self.board.cell(point), Cell::Hidden) {
                continue;
            }

            let clue = self.adjacent_mines(point);
            self.board.cells[point.y][point.x] = Cell::Revealed(clue);

            if clue == 0 {
                let neighbors: Vec<Point> = self.board.neighbors(point).collect();
                for neighbor in neighbors {
                    if matches!(self.board.cell(neighbor), Cell::Hidden) && visited.insert(neighbor)
                    {
                        queue.push_back(neighbor);
                    }
                }
            }
        }
    }

    /// Toggles a flag on a hidden cell. Revealed cells are left alone.
    pub fn toggle_flag(&mut self, at: Point) {
        match self.board.cell(at) {
            Cell::Hidden => self.board.cells[at.y][at.x] = Cell::Flagged,
            Cell::Flagged => self.board.cells[at.y][at.x] = Cell::Hidden,
            Cell::Revealed(_) => {}
        }
    }

    /// The game is won once every non-mine cell is revealed.
    fn check_win_condition(&self) -> bool {
        let unrevealed = self
            .board
            .cells
            .iter()
            .flatten()
            .filter(|cell| !matches!(cell, Cell::Revealed(_)))
            .count();
        unrevealed == self.board.total_mines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a snapshot from rows of characters: '#' hidden, 'F' flagged,
    /// digits revealed clues.
    fn board_from_rows(rows: &[&str], total_mines: usize) -> Board {
        let height = rows.len();
        let width = rows[0].len();
        let mut board = Board::new(width, height, total_mines);
        for (y, row) in rows.iter().enumerate() {
            for (x, ch) in row.chars().enumerate() {
                board.cells[y][x] = match ch {
                    '#' => Cell::Hidden,
                    'F' => Cell::Flagged,
                    digit => Cell::Revealed(digit.to_digit(10).unwrap() as u8),
                };
            }
        }
        board
    }

    fn pt(x: usize, y: usize) -> Point {
        Point { x, y }
    }

    #[test]
    fn test_board_initialization() {
        let board = Board::new(5, 4, 3);
        assert_eq!(board.width, 5);
        assert_eq!(board.height, 4);
        assert_eq!(board.total_mines, 3);

        // Verify all cells start as hidden
        for row in &board.cells {
            for cell in row {
                assert_eq!(*cell, Cell::Hidden);
            }
        }
        assert_eq!(board.hidden_cells().len(), 20);
        assert_eq!(board.flagged_count(), 0);
    }

    #[test]
    #[should_panic(expected = "Total mines must be less than the number of cells on the board.")]
    fn test_board_initialization_too_many_mines() {
        Board::new(3, 3, 9);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut board = Board::new(4, 4, 3);
        board.cells[1][2] = Cell::Revealed(2);
        board.cells[0][0] = Cell::Flagged;

        let bytes = board.serialize();
        assert_eq!(Board::deserialize(&bytes), board);
    }

    #[test]
    fn test_rejects_malformed_snapshot() {
        let mut board = Board::new(3, 3, 2);
        board.cells.push(vec![Cell::Hidden; 3]); // extra row the dimensions deny
        assert!(board.validate().is_err());
        assert!(compute_probabilities(&board).is_err());

        let mut ragged = Board::new(3, 3, 2);
        ragged.cells[1].pop();
        assert!(ragged.validate().is_err());
    }

    #[test]
    fn test_get_neighbors() {
        let board = Board::new(3, 3, 1);

        // Corner cell (0,0) should have 3 neighbors
        assert_eq!(board.neighbors(pt(0, 0)).count(), 3);
        // Center cell (1,1) should have 8 neighbors
        assert_eq!(board.neighbors(pt(1, 1)).count(), 8);
        // Edge cell (1,0) should have 5 neighbors
        assert_eq!(board.neighbors(pt(1, 0)).count(), 5);
    }

    #[test]
    fn test_constraint_extraction() {
        // A revealed '2' with one flagged neighbor and seven hidden ones
        // should produce a single constraint requiring one more mine.
        let board = board_from_rows(&["###", "#2F", "###"], 2);

        let constraints = board.build_constraints();
        assert_eq!(constraints.len(), 1);
        assert_eq!(constraints[0].required_mines, 1);
        assert_eq!(constraints[0].variables.len(), 7);
        assert!(!constraints[0].variables.contains(&pt(2, 1)));

        // A fully revealed board carries no information.
        let done = board_from_rows(&["11", "11"], 1);
        assert!(done.build_constraints().is_empty());
    }

    #[test]
    fn test_forced_mine_single_neighbor() {
        // A revealed '1' whose only hidden neighbor must therefore be the
        // mine: direct resolution pins it to 1.0.
        let board = board_from_rows(&["1#", "11"], 1);

        let analysis = compute_probabilities(&board).unwrap();
        assert_eq!(analysis.probabilities.len(), 1);
        assert_eq!(analysis.probabilities[&pt(1, 0)], 1.0);
        assert!(analysis.deduced_mines.contains(&pt(1, 0)));
        assert!(analysis.deduced_safe.is_empty());
        assert!(analysis.exhaustive);
    }

    #[test]
    fn test_zero_count_constraint_resolves_safe() {
        // A constraint demanding zero mines clears all of its cells, the
        // degenerate case a zero clue would produce if one ever reached the
        // propagation stage.
        let cells: BTreeSet<Point> = [pt(0, 0), pt(1, 0), pt(2, 0)].into_iter().collect();
        let result = propagate(vec![Constraint {
            variables: cells.clone(),
            required_mines: 0,
        }]);

        let expected: HashSet<Point> = cells.into_iter().collect();
        assert_eq!(result.safe, expected);
        assert!(result.mines.is_empty());
        assert!(result.residual.is_empty());
    }

    #[test]
    fn test_subset_elimination() {
        // {x,y,z} holds one mine and its subset {x,y} holds one mine, so z
        // must be clear. Direct resolution cannot see this; elimination
        // subtracts the rows.
        let x = pt(0, 0);
        let y = pt(1, 0);
        let z = pt(2, 0);
        let result = propagate(vec![
            Constraint {
                variables: [x, y, z].into_iter().collect(),
                required_mines: 1,
            },
            Constraint {
                variables: [x, y].into_iter().collect(),
                required_mines: 1,
            },
        ]);

        assert!(result.safe.contains(&z));
        assert!(result.mines.is_empty());
        for constraint in &result.residual {
            assert_eq!(constraint.variables.len(), 2);
            assert_eq!(constraint.required_mines, 1);
        }
    }

    #[test]
    fn test_uniform_when_no_constraints() {
        // Nothing revealed yet: every hidden cell shares the global rate.
        let board = Board::new(9, 9, 10);

        let analysis = compute_probabilities(&board).unwrap();
        assert_eq!(analysis.probabilities.len(), 81);
        for &p in analysis.probabilities.values() {
            assert_eq!(p, 10.0 / 81.0);
        }
        assert!(analysis.exhaustive);
    }

    #[test]
    fn test_synthesizer_binomial_weighting() {
        // One component of three cells admitting {1 mine: 2 ways, 2 mines:
        // 1 way}, a reservoir of 20 unconstrained cells, and 5 mines left.
        let a = pt(0, 0);
        let b = pt(1, 0);
        let c = pt(2, 0);
        let component = Enumeration {
            cells: vec![a, b, c],
            assignments: vec![
                Assignment {
                    mines_at: vec![true, false, false],
                    mine_count: 1,
                },
                Assignment {
                    mines_at: vec![false, true, false],
                    mine_count: 1,
                },
                Assignment {
                    mines_at: vec![true, true, false],
                    mine_count: 2,
                },
            ],
            truncated: false,
        };

        let mut hidden = vec![a, b, c];
        hidden.extend((0..20).map(|x| pt(x, 5)));

        let (probabilities, exact) =
            synthesize(&[component], &HashSet::new(), &HashSet::new(), &hidden, 5);
        assert!(exact);

        // total weight = 2*C(20,4) + 1*C(20,3) = 9690 + 1140
        // mined weight of a (and b) = C(20,4) + C(20,3) = 5985
        // reservoir weight = 2*C(19,3) + 1*C(19,2) = 2109
        assert_eq!(probabilities[&a], 5985.0 / 10830.0);
        assert_eq!(probabilities[&b], 5985.0 / 10830.0);
        assert_eq!(probabilities[&c], 0.0);
        assert_eq!(probabilities[&pt(0, 5)], 2109.0 / 10830.0);

        let sum: f64 = probabilities.values().sum();
        assert!((sum - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_conservation_and_bounds() {
        // Two overlapping clues plus a zero: elimination clears the corner,
        // the remaining pair splits the single mine evenly.
        let board = board_from_rows(&["###", "110"], 1);

        let analysis = compute_probabilities(&board).unwrap();
        assert!(analysis.exhaustive);
        assert_eq!(analysis.probabilities[&pt(0, 0)], 0.5);
        assert_eq!(analysis.probabilities[&pt(1, 0)], 0.5);
        assert_eq!(analysis.probabilities[&pt(2, 0)], 0.0);
        assert!(analysis.deduced_safe.contains(&pt(2, 0)));

        for &p in analysis.probabilities.values() {
            assert!((0.0..=1.0).contains(&p));
        }
        let sum: f64 = analysis.probabilities.values().sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_idempotent_queries() {
        let board = board_from_rows(&["####", "1221", "0000"], 2);

        let first = compute_probabilities(&board).unwrap();
        let second = compute_probabilities(&board).unwrap();
        assert_eq!(first.probabilities, second.probabilities);
        assert_eq!(first.deduced_safe, second.deduced_safe);
        assert_eq!(first.deduced_mines, second.deduced_mines);

        let sum: f64 = first.probabilities.values().sum();
        assert!((sum - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_over_flagged_constraint_dropped() {
        // The clue '1' already has two flagged neighbors, so its remainder
        // is negative. The constraint is contradictory and must be dropped
        // without failing the query.
        let board = board_from_rows(&["F1F", "###"], 2);

        let analysis = compute_probabilities(&board).unwrap();
        assert_eq!(analysis.probabilities.len(), 3);
        // Both mines are claimed by flags, so nothing remains to place.
        for &p in analysis.probabilities.values() {
            assert_eq!(p, 0.0);
        }
    }

    #[test]
    fn test_partition_into_independent_components() {
        let left = Constraint {
            variables: [pt(0, 0), pt(1, 0)].into_iter().collect(),
            required_mines: 1,
        };
        let right = Constraint {
            variables: [pt(5, 5), pt(6, 5)].into_iter().collect(),
            required_mines: 1,
        };

        let components = partition_components(&[left, right]);
        assert_eq!(components.len(), 2);
        for component in &components {
            assert_eq!(component.cells.len(), 2);
            assert_eq!(component.constraints.len(), 1);
        }
    }

    #[test]
    fn test_enumerator_finds_all_assignments() {
        // Three cells, exactly two mines: C(3,2) = 3 assignments.
        let component = Component {
            cells: vec![pt(0, 0), pt(1, 0), pt(2, 0)],
            constraints: vec![Constraint {
                variables: [pt(0, 0), pt(1, 0), pt(2, 0)].into_iter().collect(),
                required_mines: 2,
            }],
        };

        let mut budget = NODE_BUDGET;
        let enumeration = enumerate_component(&component, &mut budget, &mut rand::rng());
        assert_eq!(enumeration.assignments.len(), 3);
        assert!(!enumeration.truncated);
        assert!(budget < NODE_BUDGET);
        for assignment in &enumeration.assignments {
            assert_eq!(assignment.mine_count, 2);
        }
    }

    #[test]
    fn test_enumerator_budget_exhaustion() {
        let component = Component {
            cells: vec![pt(0, 0), pt(1, 0)],
            constraints: vec![Constraint {
                variables: [pt(0, 0), pt(1, 0)].into_iter().collect(),
                required_mines: 1,
            }],
        };

        let mut budget = 0;
        let enumeration = enumerate_component(&component, &mut budget, &mut rand::rng());
        assert!(enumeration.truncated);
        assert!(enumeration.assignments.is_empty());
    }

    #[test]
    fn test_first_move_always_safe() {
        let mut game = Game::new(5, 5, 10);
        let survived = game.reveal(pt(2, 2)).unwrap();

        assert!(survived);
        assert_eq!(game.state, GameState::Playing);
        assert!(matches!(game.board.cell(pt(2, 2)), Cell::Revealed(_)));
    }

    #[test]
    fn test_flood_fill_and_win() {
        // A single mine in the far corner: opening the opposite corner
        // cascades across the whole board and wins outright.
        let mut game = Game::new(5, 5, 1);
        game.mines = HashSet::from([pt(4, 4)]);

        let survived = game.reveal(pt(0, 0)).unwrap();
        assert!(survived);
        assert_eq!(game.board.cell(pt(3, 3)), Cell::Revealed(1));
        assert_eq!(game.board.cell(pt(0, 0)), Cell::Revealed(0));
        assert_eq!(game.board.cell(pt(4, 4)), Cell::Hidden);
        assert_eq!(game.state, GameState::Won);
    }

    #[test]
    fn test_reveal_mine_loses() {
        let mut game = Game::new(4, 4, 2);
        game.mines = HashSet::from([pt(3, 3), pt(0, 3)]);

        assert!(!game.reveal(pt(3, 3)).unwrap());
        assert_eq!(game.state, GameState::Lost);
        // Further moves are rejected once the game is over.
        assert!(game.reveal(pt(0, 0)).is_err());
    }

    #[test]
    fn test_toggle_flag() {
        let mut game = Game::new(3, 3, 1);
        game.mines = HashSet::from([pt(2, 2)]);

        game.toggle_flag(pt(0, 0));
        assert_eq!(game.board.cell(pt(0, 0)), Cell::Flagged);
        assert_eq!(game.board.flagged_count(), 1);

        // Revealing a flagged cell is a no-op.
        assert!(game.reveal(pt(0, 0)).unwrap());
        assert_eq!(game.board.cell(pt(0, 0)), Cell::Flagged);

        game.toggle_flag(pt(0, 0));
        assert_eq!(game.board.cell(pt(0, 0)), Cell::Hidden);
    }

    #[test]
    fn test_engine_pins_isolated_mine() {
        // After the cascade around a lone corner mine, three clues each
        // point at the same single hidden cell.
        let mut game = Game::new(5, 5, 1);
        game.mines = HashSet::from([pt(4, 4)]);
        game.reveal(pt(0, 0)).unwrap();

        let analysis = compute_probabilities(&game.board).unwrap();
        assert_eq!(analysis.probabilities.len(), 1);
        assert_eq!(analysis.probabilities[&pt(4, 4)], 1.0);
        assert_eq!(analysis.mine_cells(), vec![pt(4, 4)]);
        assert!(analysis.exhaustive);
    }

    #[test]
    fn test_analysis_helpers() {
        let board = board_from_rows(&["###", "110"], 1);
        let analysis = compute_probabilities(&board).unwrap();

        assert_eq!(analysis.safe_cells(), vec![pt(2, 0)]);
        assert!(analysis.mine_cells().is_empty());
        // The safe corner is also the least risky guess.
        assert_eq!(analysis.best_guess(), Some(pt(2, 0)));
    }
}
