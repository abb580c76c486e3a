use mineprob::*;
use std::thread;
use std::time::Duration;

fn main() {
    // --- 1. Initialization ---
    let mut game = Game::new(10, 10, 15);

    println!("--- Autonomous Minesweeper Bot ---");
    println!("Strategy: flag certain mines, open certain cells, otherwise take the least risky guess.");
    println!("Initial Board:");
    print_board(&game);
    thread::sleep(Duration::from_secs(1));

    // The opening move has no information to work from; take the center.
    game.reveal(Point { x: 5, y: 5 }).unwrap();
    print_board(&game);

    // --- 2. Game Loop ---
    let mut move_count = 0;
    while game.state == GameState::Playing {
        move_count += 1;
        println!("\n--- Move #{} ---", move_count);

        // --- 3. Bot's Decision Logic ---
        let analysis = compute_probabilities(&game.board).unwrap();
        if !analysis.exhaustive {
            println!("(probabilities are sampled estimates for this position)");
        }

        // Flag every certain mine so the clue arithmetic stays honest.
        for cell in analysis.mine_cells() {
            if matches!(game.board.cell(cell), Cell::Hidden) {
                println!("Logic proved ({}, {}) is a mine. Flagging it.", cell.x, cell.y);
                game.toggle_flag(cell);
            }
        }

        // --- 4. Execute the Chosen Move(s) ---
        let safe = analysis.safe_cells();
        if !safe.is_empty() {
            println!("Logic found {} guaranteed safe cell(s). Opening them.", safe.len());
            for cell in safe {
                if game.state != GameState::Playing {
                    break;
                }
                game.reveal(cell).unwrap();
            }
        } else if let Some(cell) = analysis.best_guess() {
            let risk = analysis.probabilities[&cell];
            println!(
                "No certain move. Guessing ({}, {}) at {:.0}% mine risk...",
                cell.x,
                cell.y,
                risk * 100.0
            );
            game.reveal(cell).unwrap();
        } else {
            // No hidden cells remain to act on; the game should already be
            // decided at this point.
            println!("No moves left for the bot to make.");
            break;
        }

        print_board(&game);

        // Add a delay to make the game watchable
        thread::sleep(Duration::from_millis(300));
    }

    // --- 5. Final Result ---
    println!("\n--- Game Over ---");

    match game.state {
        GameState::Won => println!("Result: The bot won!"),
        GameState::Lost => println!("Result: The bot hit a mine and lost."),
        GameState::Playing => println!("Result: The game ended unexpectedly."),
    }
}

fn print_board(game: &Game) {
    // Print header
    print!("   ");
    for x in 0..game.board.width {
        print!("{:^3}", x);
    }
    println!("\n  +{}", "---".repeat(game.board.width));

    // Print rows
    for (y, row) in game.board.cells.iter().enumerate() {
        print!("{:^2}|", y);
        for cell in row {
            let display = match cell {
                Cell::Hidden => " ■ ".to_string(),
                Cell::Flagged => " ⚑ ".to_string(),
                Cell::Revealed(0) => " 0 ".to_string(),
                Cell::Revealed(n) => format!(" {} ", n),
            };
            print!("{}", display);
        }
        println!();
    }
    println!();
}
